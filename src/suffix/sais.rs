//! Linear-time suffix array construction by induced sorting (SA-IS).
//!
//! Uses a virtual sentinel: the empty suffix is never stored, and the last
//! suffix is always L-type. Recursion works on the reduced string of LMS
//! substring names, which is at most half the input.

trait Symbol: Copy {
    fn index(self) -> usize;
}

impl Symbol for u8 {
    fn index(self) -> usize {
        self as usize
    }
}

impl Symbol for i32 {
    fn index(self) -> usize {
        self as usize
    }
}

/// Sort the suffixes of `text` into `sa`.
///
/// `sa` must be exactly as long as `text`, and `text` shorter than
/// `i32::MAX` bytes. On return `sa[r]` is the start of the r-th smallest
/// suffix.
pub fn suffix_array(text: &[u8], sa: &mut [i32]) {
    debug_assert_eq!(text.len(), sa.len());
    debug_assert!(text.len() < i32::MAX as usize);
    sais(text, sa, u8::MAX as usize);
}

fn sais<T: Symbol>(s: &[T], sa: &mut [i32], upper: usize) {
    let n = s.len();
    match n {
        0 => return,
        1 => {
            sa[0] = 0;
            return;
        }
        2 => {
            if s[0].index() < s[1].index() {
                sa[0] = 0;
                sa[1] = 1;
            } else {
                sa[0] = 1;
                sa[1] = 0;
            }
            return;
        }
        _ => {}
    }

    // true = S-type
    let mut ls = vec![false; n];
    for i in (0..n - 1).rev() {
        let (a, b) = (s[i].index(), s[i + 1].index());
        ls[i] = if a == b { ls[i + 1] } else { a < b };
    }

    let mut counts = vec![0usize; upper + 1];
    for &c in s {
        counts[c.index()] += 1;
    }

    let lms: Vec<i32> = (1..n)
        .filter(|&i| is_lms(&ls, i))
        .map(|i| i as i32)
        .collect();
    let m = lms.len();

    // Sorting LMS substrings: seed in text order, then induce
    induce(s, sa, &ls, &counts, &lms);
    if m == 0 {
        return;
    }

    // Sorted LMS positions to the front
    let mut k = 0;
    for i in 0..n {
        let v = sa[i];
        if v > 0 && is_lms(&ls, v as usize) {
            sa[k] = v;
            k += 1;
        }
    }

    // Name LMS substrings; LMS positions are at least 2 apart so pos / 2
    // gives each one its own slot above m
    sa[m..].fill(-1);
    let mut name = 0usize;
    for i in 0..m {
        let pos = sa[i] as usize;
        if i > 0 && !same_lms_substring(s, &ls, sa[i - 1] as usize, pos) {
            name += 1;
        }
        sa[m + pos / 2] = name as i32;
    }

    let mut reduced: Vec<i32> = sa[m..].iter().copied().filter(|&v| v >= 0).collect();

    {
        let sub = &mut sa[..m];
        if name + 1 < m {
            sais(&reduced, sub, name);
        } else {
            for (i, &c) in reduced.iter().enumerate() {
                sub[c as usize] = i as i32;
            }
        }
    }

    // Reduced ranks back to text positions, now in suffix order
    for i in 0..m {
        reduced[i] = lms[sa[i] as usize];
    }
    induce(s, sa, &ls, &counts, &reduced);
}

fn is_lms(ls: &[bool], i: usize) -> bool {
    i > 0 && ls[i] && !ls[i - 1]
}

fn next_lms(ls: &[bool], from: usize) -> usize {
    let mut i = from + 1;
    while i < ls.len() && !is_lms(ls, i) {
        i += 1;
    }
    i
}

/// Equal LMS substrings have equal length, equal bytes, and do not reach
/// the sentinel.
fn same_lms_substring<T: Symbol>(s: &[T], ls: &[bool], a: usize, b: usize) -> bool {
    let n = s.len();
    let end_a = next_lms(ls, a);
    let end_b = next_lms(ls, b);
    if end_a - a != end_b - b || end_a == n || end_b == n {
        return false;
    }
    (0..=end_a - a).all(|d| s[a + d].index() == s[b + d].index())
}

fn bucket_starts(counts: &[usize]) -> Vec<usize> {
    let mut sum = 0;
    counts
        .iter()
        .map(|&c| {
            let start = sum;
            sum += c;
            start
        })
        .collect()
}

fn bucket_ends(counts: &[usize]) -> Vec<usize> {
    let mut sum = 0;
    counts
        .iter()
        .map(|&c| {
            sum += c;
            sum
        })
        .collect()
}

/// Induced sort from LMS seeds given in the order they should keep
/// within each bucket.
fn induce<T: Symbol>(s: &[T], sa: &mut [i32], ls: &[bool], counts: &[usize], lms: &[i32]) {
    let n = s.len();
    sa.fill(-1);

    let mut ends = bucket_ends(counts);
    for &p in lms.iter().rev() {
        let c = s[p as usize].index();
        ends[c] -= 1;
        sa[ends[c]] = p;
    }

    // L-type, left to right; the sentinel induces the last suffix first
    let mut starts = bucket_starts(counts);
    let c = s[n - 1].index();
    sa[starts[c]] = (n - 1) as i32;
    starts[c] += 1;
    for i in 0..n {
        let v = sa[i];
        if v >= 1 {
            let j = (v - 1) as usize;
            if !ls[j] {
                let c = s[j].index();
                sa[starts[c]] = j as i32;
                starts[c] += 1;
            }
        }
    }

    // S-type, right to left
    let mut ends = bucket_ends(counts);
    for i in (0..n).rev() {
        let v = sa[i];
        if v >= 1 {
            let j = (v - 1) as usize;
            if ls[j] {
                let c = s[j].index();
                ends[c] -= 1;
                sa[ends[c]] = j as i32;
            }
        }
    }
}
