use super::sais::suffix_array;
use super::SuffixScratch;
use rayon::prelude::*;

/// Suffix array of a buffer cut into fixed, contiguous partitions.
///
/// Each partition is sorted on its own (in parallel) and searched on its
/// own; a match never crosses a partition boundary. Partition boundaries
/// depend only on the buffer length and partition count.
pub struct PartitionedSuffixArray<'a> {
    old: &'a [u8],
    sa: &'a [i32],
    starts: Vec<usize>,
}

impl<'a> PartitionedSuffixArray<'a> {
    pub fn build(
        old: &'a [u8],
        partitions: usize,
        scratch: &'a mut SuffixScratch,
        pool: &rayon::ThreadPool,
    ) -> Self {
        let n = old.len();
        let chunk = n.div_ceil(partitions.max(1)).max(1);
        let sa = scratch.suffix_array_buffer(n);

        pool.install(|| {
            old.par_chunks(chunk)
                .zip(sa.par_chunks_mut(chunk))
                .for_each(|(text, part)| suffix_array(text, part));
        });

        let starts = (0..n).step_by(chunk).collect();
        Self { old, sa, starts }
    }

    pub fn partitions(&self) -> usize {
        self.starts.len()
    }

    fn partition(&self, index: usize) -> (usize, usize) {
        let start = self.starts[index];
        let end = self
            .starts
            .get(index + 1)
            .copied()
            .unwrap_or(self.old.len());
        (start, end)
    }

    /// Longest match of a prefix of `needle` in the old buffer.
    ///
    /// Returns `(old position, length)`; ties go to the lowest partition.
    pub fn search(&self, needle: &[u8]) -> (usize, usize) {
        let mut best = (0, 0);
        for index in 0..self.starts.len() {
            let (start, end) = self.partition(index);
            let (pos, len) = search_partition(&self.old[start..end], &self.sa[start..end], needle);
            if len > best.1 {
                best = (start + pos, len);
                if len == needle.len() {
                    break;
                }
            }
        }
        best
    }
}

fn matchlen(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Binary search for the insertion point of `needle`, then take the
/// better of the two neighbouring suffixes.
fn search_partition(text: &[u8], sa: &[i32], needle: &[u8]) -> (usize, usize) {
    if sa.is_empty() || needle.is_empty() {
        return (0, 0);
    }

    let mut lo = 0;
    let mut hi = sa.len() - 1;
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        let pos = sa[mid] as usize;
        let len = matchlen(&text[pos..], needle);
        if len == needle.len() {
            return (pos, len);
        }
        // Suffix sorts before needle if it is a proper prefix of it or
        // differs with a smaller byte
        if pos + len == text.len() || text[pos + len] < needle[len] {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    let lo_pos = sa[lo] as usize;
    let hi_pos = sa[hi] as usize;
    let lo_len = matchlen(&text[lo_pos..], needle);
    let hi_len = matchlen(&text[hi_pos..], needle);
    if hi_len > lo_len {
        (hi_pos, hi_len)
    } else {
        (lo_pos, lo_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(threads: usize) -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap()
    }

    fn brute_force_best(old: &[u8], needle: &[u8], starts: &[usize]) -> usize {
        let mut best = 0;
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(old.len());
            for pos in start..end {
                best = best.max(matchlen(&old[pos..end], needle));
            }
        }
        best
    }

    #[test]
    fn test_search_single_partition() {
        let old = b"the quick brown fox jumps over the lazy dog";
        let mut scratch = SuffixScratch::new();
        let psa = PartitionedSuffixArray::build(old, 1, &mut scratch, &pool(1));
        assert_eq!(psa.partitions(), 1);

        let (pos, len) = psa.search(b"jumps high");
        assert_eq!(len, 6);
        assert_eq!(&old[pos..pos + len], b"jumps ");

        let (_, len) = psa.search(b"zzz");
        assert_eq!(len, 1);
        assert_eq!(psa.search(b"").1, 0);
    }

    #[test]
    fn test_search_across_partitions_finds_longest() {
        let old: Vec<u8> = (0..4000u32).map(|i| (i * 7919 % 253) as u8).collect();
        let mut scratch = SuffixScratch::new();
        let psa = PartitionedSuffixArray::build(&old, 4, &mut scratch, &pool(4));
        assert_eq!(psa.partitions(), 4);

        for offset in [0usize, 17, 999, 1000, 1001, 2500, 3990] {
            let needle = &old[offset..(offset + 64).min(old.len())];
            let (pos, len) = psa.search(needle);
            assert_eq!(len, brute_force_best(&old, needle, &psa.starts));
            assert_eq!(&old[pos..pos + len], &needle[..len]);
        }
    }

    #[test]
    fn test_empty_old() {
        let mut scratch = SuffixScratch::new();
        let psa = PartitionedSuffixArray::build(b"", 8, &mut scratch, &pool(2));
        assert_eq!(psa.partitions(), 0);
        assert_eq!(psa.search(b"abc"), (0, 0));
    }

    #[test]
    fn test_same_result_for_any_thread_count() {
        let old: Vec<u8> = (0..10_000u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
        let mut a = SuffixScratch::new();
        let mut b = SuffixScratch::new();
        let sa1 = PartitionedSuffixArray::build(&old, 3, &mut a, &pool(1)).sa.to_vec();
        let sa2 = PartitionedSuffixArray::build(&old, 3, &mut b, &pool(8)).sa.to_vec();
        assert_eq!(sa1, sa2);
    }
}
