use super::{Control, PartitionedSuffixArray, SuffixScratch, MAX_SUFFIX_INPUT};
use crate::error::{format_bytes, PatchError, Result};
use crate::progress::ProgressSink;
use rayon::prelude::*;
use std::time::{Duration, Instant};

/// Size of the new-buffer blocks scanned independently
pub const SCAN_BLOCK_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Default)]
pub struct SuffixDiffStats {
    pub controls: u64,
    pub add_bytes: u64,
    pub copy_bytes: u64,
    pub biggest_add: u64,
    pub sort_time: Duration,
    pub scan_time: Duration,
}

/// One matched run inside a scan block. New-side positions are relative
/// to the block, old-side positions are absolute.
#[derive(Debug, Clone, Copy)]
struct Chunk {
    add_old_start: usize,
    add_new_start: usize,
    add_length: usize,
    copy_start: usize,
    copy_end: usize,
    offset: usize,
}

/// Suffix-array differ with a fixed worker pool.
pub struct SuffixDiffer {
    partitions: usize,
    pool: rayon::ThreadPool,
}

impl SuffixDiffer {
    /// `partitions` fixes how the old buffer is split (and so the output);
    /// `workers` only sets the thread count.
    pub fn new(partitions: usize, workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("suffix-diff-{}", i))
            .build()
            .map_err(|e| PatchError::InvalidInput(format!("Failed to start worker pool: {}", e)))?;
        Ok(Self {
            partitions: partitions.max(1),
            pool,
        })
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Diff `new` against `old`, handing each [`Control`] to `emit` in
    /// order. The last control emitted is the EOF marker.
    pub fn diff<F>(
        &self,
        old: &[u8],
        new: &[u8],
        scratch: &mut SuffixScratch,
        progress: &dyn ProgressSink,
        mut emit: F,
    ) -> Result<SuffixDiffStats>
    where
        F: FnMut(Control) -> Result<()>,
    {
        if old.len() >= MAX_SUFFIX_INPUT {
            return Err(PatchError::InvalidInput(format!(
                "old buffer of {} is too large for suffix diffing",
                format_bytes(old.len() as u64)
            )));
        }

        let mut stats = SuffixDiffStats::default();
        let partitions = if self.partitions >= old.len().saturating_sub(1) {
            1
        } else {
            self.partitions
        };

        progress.progress_label(&format!("Sorting {}...", format_bytes(old.len() as u64)));
        progress.progress(0.0);
        let started = Instant::now();
        let psa = PartitionedSuffixArray::build(old, partitions, scratch, &self.pool);
        stats.sort_time = started.elapsed();
        tracing::debug!(
            "Sorted {} in {} partitions in {:?}",
            format_bytes(old.len() as u64),
            psa.partitions(),
            stats.sort_time
        );

        let mut block_size = SCAN_BLOCK_SIZE;
        let mut num_blocks = new.len().div_ceil(block_size);
        if num_blocks < partitions {
            block_size = (new.len() / partitions).max(1);
            num_blocks = new.len().div_ceil(block_size);
        }

        progress.progress_label(&format!(
            "Scanning {} ({} blocks of {})...",
            format_bytes(new.len() as u64),
            num_blocks,
            format_bytes(block_size as u64)
        ));
        let started = Instant::now();

        // Collected by block index, never by completion order
        let blocks: Vec<Vec<Chunk>> = self.pool.install(|| {
            (0..num_blocks)
                .into_par_iter()
                .map(|block| {
                    let start = block * block_size;
                    let end = (start + block_size).min(new.len());
                    analyze_block(&psa, old, &new[start..end], start)
                })
                .collect()
        });

        let mut cursor = 0usize;
        let mut pending: Option<Control> = None;
        for (block, chunks) in blocks.iter().enumerate() {
            progress.progress(block as f64 / num_blocks as f64);
            for chunk in chunks {
                let target = chunk.add_old_start as i64;
                match pending.take() {
                    Some(mut control) => {
                        control.seek = target - cursor as i64;
                        record(&mut stats, &control);
                        emit(control)?;
                    }
                    None if target != 0 => {
                        emit(Control {
                            seek: target,
                            ..Control::default()
                        })?;
                        stats.controls += 1;
                    }
                    None => {}
                }

                let new_start = chunk.offset + chunk.add_new_start;
                let add = new[new_start..new_start + chunk.add_length]
                    .iter()
                    .zip(&old[chunk.add_old_start..chunk.add_old_start + chunk.add_length])
                    .map(|(n, o)| n.wrapping_sub(*o))
                    .collect();
                let copy = new[chunk.offset + chunk.copy_start..chunk.offset + chunk.copy_end].to_vec();
                cursor = chunk.add_old_start + chunk.add_length;
                pending = Some(Control {
                    add,
                    copy,
                    seek: 0,
                    eof: false,
                });
            }
        }

        if let Some(control) = pending {
            record(&mut stats, &control);
            emit(control)?;
        }
        emit(Control::eof())?;

        stats.scan_time = started.elapsed();
        progress.progress(1.0);
        tracing::debug!(
            "Suffix diff: {} controls, {} add, {} copy, scanned in {:?}",
            stats.controls,
            format_bytes(stats.add_bytes),
            format_bytes(stats.copy_bytes),
            stats.scan_time
        );
        Ok(stats)
    }
}

fn record(stats: &mut SuffixDiffStats, control: &Control) {
    stats.controls += 1;
    stats.add_bytes += control.add.len() as u64;
    stats.copy_bytes += control.copy.len() as u64;
    stats.biggest_add = stats.biggest_add.max(control.add.len() as u64);
}

/// Classic bsdiff scan over one block of the new buffer.
///
/// A run ends where the exact match found by the suffix search beats the
/// approximate match obtained by continuing the previous alignment
/// (`oldscore`) by more than 8 bytes. Each run's aligned region is then
/// extended forward from the previous match and backward from the next
/// one, and any overlap between the two is split where it loses the
/// fewest matching bytes.
fn analyze_block(psa: &PartitionedSuffixArray<'_>, old: &[u8], nbuf: &[u8], offset: usize) -> Vec<Chunk> {
    let obuflen = old.len() as isize;
    let nbuflen = nbuf.len() as isize;
    let old_at = |i: isize| -> Option<u8> {
        if i >= 0 && i < obuflen {
            Some(old[i as usize])
        } else {
            None
        }
    };

    let mut chunks = Vec::new();
    let (mut scan, mut pos, mut len) = (0isize, 0isize, 0isize);
    let (mut lastscan, mut lastpos, mut lastoffset) = (0isize, 0isize, 0isize);

    while scan < nbuflen {
        let mut oldscore = 0isize;
        scan += len;

        let mut scsc = scan;
        while scan < nbuflen {
            let (p, l) = psa.search(&nbuf[scan as usize..]);
            pos = p as isize;
            len = l as isize;

            while scsc < scan + len {
                if old_at(scsc + lastoffset) == Some(nbuf[scsc as usize]) {
                    oldscore += 1;
                }
                scsc += 1;
            }

            if (len == oldscore && len != 0) || len > oldscore + 8 {
                break;
            }

            if old_at(scan + lastoffset) == Some(nbuf[scan as usize]) {
                oldscore -= 1;
            }
            scan += 1;
        }

        if len != oldscore || scan == nbuflen {
            let mut lenf = 0isize;
            {
                let (mut s, mut best) = (0isize, 0isize);
                let mut i = 0isize;
                while lastscan + i < scan && lastpos + i < obuflen {
                    if old[(lastpos + i) as usize] == nbuf[(lastscan + i) as usize] {
                        s += 1;
                    }
                    i += 1;
                    if s * 2 - i > best * 2 - lenf {
                        best = s;
                        lenf = i;
                    }
                }
            }

            let mut lenb = 0isize;
            if scan < nbuflen {
                let (mut s, mut best) = (0isize, 0isize);
                let mut i = 1isize;
                while scan >= lastscan + i && pos >= i {
                    if old[(pos - i) as usize] == nbuf[(scan - i) as usize] {
                        s += 1;
                    }
                    if s * 2 - i > best * 2 - lenb {
                        best = s;
                        lenb = i;
                    }
                    i += 1;
                }
            }

            if lastscan + lenf > scan - lenb {
                let overlap = (lastscan + lenf) - (scan - lenb);
                let (mut s, mut best, mut lens) = (0isize, 0isize, 0isize);
                for i in 0..overlap {
                    if nbuf[(lastscan + lenf - overlap + i) as usize]
                        == old[(lastpos + lenf - overlap + i) as usize]
                    {
                        s += 1;
                    }
                    if nbuf[(scan - lenb + i) as usize] == old[(pos - lenb + i) as usize] {
                        s -= 1;
                    }
                    if s > best {
                        best = s;
                        lens = i + 1;
                    }
                }
                lenf += lens - overlap;
                lenb -= lens;
            }

            let chunk = Chunk {
                add_old_start: lastpos as usize,
                add_new_start: lastscan as usize,
                add_length: lenf as usize,
                copy_start: (lastscan + lenf) as usize,
                copy_end: (scan - lenb) as usize,
                offset,
            };
            if chunk.add_length > 0 || chunk.copy_end != chunk.copy_start {
                chunks.push(chunk);
            }

            lastscan = scan - lenb;
            lastpos = pos - lenb;
            lastoffset = pos - scan;
        }
    }

    chunks
}
