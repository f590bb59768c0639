//! Patch generation: block-diff every new file against the old tree's
//! signature, optionally re-encoding files with the suffix differ.

use crate::compress::CompressionSettings;
use crate::container::Container;
use crate::delta::{
    num_blocks, range_len, BlockDiffer, BlockHash, BlockLibrary, Operation, BLOCK_SIZE,
};
use crate::error::{format_bytes, Result};
use crate::pool::{read_all, Pool};
use crate::progress::{NopProgress, ProgressSink};
use crate::protocol::{
    Algorithm, MessageWrite, PatchHeader, SuffixHeader, SyncHeader, SyncOp, WireWriter,
    PATCH_MAGIC,
};
use crate::suffix::{SuffixDiffer, SuffixScratch};
use std::collections::BTreeMap;
use std::io::Write;

/// Default largest file (old or new) considered for suffix diffing
pub const DEFAULT_SUFFIX_SIZE_LIMIT: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub compression: CompressionSettings,
    /// Re-encode files with the suffix differ when an old file is available
    pub suffix: bool,
    pub suffix_size_limit: u64,
    /// Suffix-array partitions; changes the output
    pub partitions: usize,
    /// Worker threads; never changes the output
    pub workers: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            compression: CompressionSettings::default(),
            suffix: true,
            suffix_size_limit: DEFAULT_SUFFIX_SIZE_LIMIT,
            partitions: cpus,
            workers: cpus,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffStats {
    /// Bytes carried literally in the patch
    pub fresh_bytes: u64,
    /// Bytes taken from the old tree
    pub reused_bytes: u64,
    pub block_files: u64,
    pub suffix_files: u64,
    /// Files that are exactly one old file
    pub transpositions: u64,
}

/// Old file a suffix diff reads from, and how much of it the block diff reused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SuffixMapping {
    target_index: usize,
    reused: u64,
}

pub struct DiffContext {
    target: Container,
    source: Container,
    library: BlockLibrary,
    options: DiffOptions,
    progress: Box<dyn ProgressSink>,
    stats: DiffStats,
}

impl DiffContext {
    /// `target_signature` holds the block hashes of the old tree
    pub fn new(
        target: Container,
        target_signature: Vec<BlockHash>,
        source: Container,
        options: DiffOptions,
    ) -> Self {
        Self {
            target,
            source,
            library: BlockLibrary::new(target_signature, BLOCK_SIZE),
            options,
            progress: Box::new(NopProgress),
            stats: DiffStats::default(),
        }
    }

    pub fn set_progress(&mut self, progress: Box<dyn ProgressSink>) {
        self.progress = progress;
    }

    pub fn stats(&self) -> &DiffStats {
        &self.stats
    }

    /// Write a complete patch to `out`.
    ///
    /// `source_pool` reads the new tree. `target_pool` reads the old tree
    /// and is only needed for suffix diffing; without it every file is
    /// block-diffed.
    pub fn write_patch<W: Write>(
        &mut self,
        source_pool: &mut dyn Pool,
        mut target_pool: Option<&mut dyn Pool>,
        out: W,
    ) -> Result<W> {
        let header = PatchHeader {
            compression: self.options.compression,
        };
        let mut wire = WireWriter::new(out, PATCH_MAGIC, &header)?;
        wire.write_message(&self.target)?;
        wire.write_message(&self.source)?;

        let suffix = match target_pool {
            Some(_) if self.options.suffix => Some(SuffixDiffer::new(
                self.options.partitions,
                self.options.workers,
            )?),
            _ => None,
        };
        let mut scratch = SuffixScratch::new();
        let by_path: BTreeMap<&str, usize> = self
            .target
            .files
            .iter()
            .enumerate()
            .map(|(i, f)| (f.path.as_str(), i))
            .collect();

        for (index, file) in self.source.files.iter().enumerate() {
            self.progress.progress_label(&file.path);
            if self.source.size > 0 {
                self.progress
                    .progress(file.offset as f64 / self.source.size as f64);
            }
            let preferred = by_path.get(file.path.as_str()).copied();

            let rediff = match (&suffix, target_pool.as_deref_mut()) {
                (Some(differ), Some(pool))
                    if file.size > 0 && file.size <= self.options.suffix_size_limit =>
                {
                    Some((differ, pool))
                }
                _ => None,
            };

            let Some((differ, old_pool)) = rediff else {
                // Stream ops straight into the patch
                wire.write_message(&SyncHeader::new(index, Algorithm::BlockDiff))?;
                let reader = source_pool.get_reader(index)?;
                let mut ops = 0u64;
                let mut first_range = None;
                for op in BlockDiffer::new(reader, &self.library, preferred) {
                    let op = op?;
                    ops += 1;
                    if ops == 1 && matches!(op, Operation::BlockRange { .. }) {
                        first_range = Some(op.clone());
                    }
                    account(&mut self.stats, &self.target, &op);
                    wire.write_message(&SyncOp::from(op))?;
                }
                wire.write_message(&SyncOp::Sentinel)?;
                if ops == 1 && is_transposition(&self.target, file.size, first_range.as_slice()) {
                    self.stats.transpositions += 1;
                } else {
                    self.stats.block_files += 1;
                }
                continue;
            };

            let ops = {
                let reader = source_pool.get_reader(index)?;
                BlockDiffer::new(reader, &self.library, preferred).collect::<Result<Vec<_>>>()?
            };

            match choose_suffix_target(
                &self.target,
                &file.path,
                preferred,
                &ops,
                self.options.suffix_size_limit,
            ) {
                Some(mapping) => {
                    tracing::debug!(
                        "{} <- {} ({} in common), suffix diffing",
                        file.path,
                        self.target.files[mapping.target_index].path,
                        format_bytes(mapping.reused)
                    );
                    let old = read_all(old_pool, mapping.target_index)?;
                    let new = read_all(source_pool, index)?;

                    wire.write_message(&SyncHeader::new(index, Algorithm::SuffixDiff))?;
                    wire.write_message(&SuffixHeader {
                        target_index: mapping.target_index as u64,
                    })?;
                    let stats = differ.diff(
                        &old,
                        &new,
                        &mut scratch,
                        self.progress.as_ref(),
                        |control| wire.write_message(&control),
                    )?;
                    wire.write_message(&SyncOp::Sentinel)?;

                    tracing::trace!(
                        "{}: {} controls, sorted in {:?}, scanned in {:?}",
                        file.path,
                        stats.controls,
                        stats.sort_time,
                        stats.scan_time
                    );
                    self.stats.reused_bytes += stats.add_bytes;
                    self.stats.fresh_bytes += stats.copy_bytes;
                    self.stats.suffix_files += 1;
                }
                None => {
                    if is_transposition(&self.target, file.size, &ops) {
                        self.stats.transpositions += 1;
                    } else {
                        self.stats.block_files += 1;
                    }
                    wire.write_message(&SyncHeader::new(index, Algorithm::BlockDiff))?;
                    for op in ops {
                        account(&mut self.stats, &self.target, &op);
                        wire.write_message(&SyncOp::from(op))?;
                    }
                    wire.write_message(&SyncOp::Sentinel)?;
                }
            }
        }

        source_pool.close()?;
        if let Some(pool) = target_pool {
            pool.close()?;
        }
        self.progress.progress(1.0);
        tracing::debug!(
            "Patch written: {} fresh, {} reused, {} messages",
            format_bytes(self.stats.fresh_bytes),
            format_bytes(self.stats.reused_bytes),
            wire.messages_written()
        );
        wire.finish()
    }
}

fn account(stats: &mut DiffStats, target: &Container, op: &Operation) {
    match op {
        Operation::Data(data) => stats.fresh_bytes += data.len() as u64,
        Operation::BlockRange {
            file_index,
            block_index,
            block_span,
        } => {
            let size = target.files.get(*file_index).map_or(0, |f| f.size);
            stats.reused_bytes += range_len(size, BLOCK_SIZE, *block_index, *block_span);
        }
    }
}

/// True if `ops` rebuild a file of `size` bytes as one whole, equally sized
/// old file; the patcher turns those into transpositions.
fn is_transposition(target: &Container, size: u64, ops: &[Operation]) -> bool {
    match ops {
        [Operation::BlockRange {
            file_index,
            block_index: 0,
            block_span,
        }] => {
            size > 0
                && *block_span == num_blocks(size, BLOCK_SIZE)
                && target.files.get(*file_index).is_some_and(|f| f.size == size)
        }
        _ => false,
    }
}

/// Pick the old file a new file should be suffix-diffed against.
///
/// A file made of a single block range is left alone. Otherwise the old file
/// the block diff reused the most bytes from wins; ties go to the old file
/// at the same path, then to the lowest index. With no reuse at all, the
/// old file at the same path is used if it is not empty.
fn choose_suffix_target(
    target: &Container,
    path: &str,
    same_path: Option<usize>,
    ops: &[Operation],
    size_limit: u64,
) -> Option<SuffixMapping> {
    if matches!(ops, [Operation::BlockRange { .. }]) {
        return None;
    }

    let mut reused: BTreeMap<usize, u64> = BTreeMap::new();
    for op in ops {
        if let Operation::BlockRange {
            file_index,
            block_index,
            block_span,
        } = op
        {
            let size = target.files.get(*file_index).map_or(0, |f| f.size);
            *reused.entry(*file_index).or_default() +=
                range_len(size, BLOCK_SIZE, *block_index, *block_span);
        }
    }

    let mut best: Option<SuffixMapping> = None;
    for (&target_index, &bytes) in &reused {
        let better = match best {
            None => true,
            Some(current) => {
                bytes > current.reused
                    || (bytes == current.reused
                        && target.files[target_index].path == path
                        && target.files[current.target_index].path != path)
            }
        };
        if better {
            best = Some(SuffixMapping {
                target_index,
                reused: bytes,
            });
        }
    }

    let best = best.or_else(|| {
        same_path
            .filter(|&i| target.files[i].size > 0)
            .map(|target_index| SuffixMapping {
                target_index,
                reused: 0,
            })
    })?;
    (target.files[best.target_index].size <= size_limit).then_some(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::compute_signature;
    use crate::pool::MemPool;
    use crate::protocol::{MessageRead, WireReader};
    use std::io::Cursor;

    fn container(files: &[(&str, usize)]) -> Container {
        let mut c = Container::new();
        for (path, size) in files {
            c.push_file(*path, *size as u64);
        }
        c
    }

    fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed.wrapping_mul(2654435761).max(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect()
    }

    fn range(file_index: usize, block_index: u64, block_span: u64) -> Operation {
        Operation::BlockRange {
            file_index,
            block_index,
            block_span,
        }
    }

    #[test]
    fn test_choose_most_reused_target() {
        let target = container(&[("a", 3 * BLOCK_SIZE), ("b", BLOCK_SIZE)]);
        let ops = vec![range(1, 0, 1), Operation::Data(vec![1]), range(0, 0, 2)];
        let mapping = choose_suffix_target(&target, "b", Some(1), &ops, u64::MAX).unwrap();
        assert_eq!(mapping.target_index, 0);
        assert_eq!(mapping.reused, 2 * BLOCK_SIZE as u64);
    }

    #[test]
    fn test_choose_tie_prefers_same_path() {
        let target = container(&[("a", BLOCK_SIZE), ("b", BLOCK_SIZE)]);
        let ops = vec![range(0, 0, 1), range(1, 0, 1)];
        let mapping = choose_suffix_target(&target, "b", Some(1), &ops, u64::MAX).unwrap();
        assert_eq!(mapping.target_index, 1);

        let mapping = choose_suffix_target(&target, "c", None, &ops, u64::MAX).unwrap();
        assert_eq!(mapping.target_index, 0);
    }

    #[test]
    fn test_choose_skips_single_range_and_large_targets() {
        let target = container(&[("a", BLOCK_SIZE)]);
        assert!(choose_suffix_target(&target, "a", Some(0), &[range(0, 0, 1)], u64::MAX).is_none());

        let ops = vec![Operation::Data(vec![0; 10])];
        assert_eq!(
            choose_suffix_target(&target, "a", Some(0), &ops, u64::MAX).map(|m| m.target_index),
            Some(0)
        );
        assert!(choose_suffix_target(&target, "a", Some(0), &ops, 10).is_none());
        assert!(choose_suffix_target(&target, "new", None, &ops, u64::MAX).is_none());
    }

    fn diff(old: Vec<Vec<u8>>, new: Vec<Vec<u8>>, options: DiffOptions) -> (Vec<u8>, DiffStats) {
        let target = container(
            &(0..old.len())
                .map(|i| (["a", "b", "c"][i], old[i].len()))
                .collect::<Vec<_>>(),
        );
        let source = container(
            &(0..new.len())
                .map(|i| (["a", "b", "c"][i], new[i].len()))
                .collect::<Vec<_>>(),
        );
        let mut old_pool = MemPool::new(old);
        let signature = compute_signature(&target, &mut old_pool, BLOCK_SIZE).unwrap();
        let mut ctx = DiffContext::new(target, signature, source, options);
        let patch = ctx
            .write_patch(&mut MemPool::new(new), Some(&mut old_pool as &mut dyn Pool), Vec::new())
            .unwrap();
        (patch, ctx.stats().clone())
    }

    #[test]
    fn test_unchanged_file_counts_as_transposition() {
        let data = noise(BLOCK_SIZE + 10, 1);
        let (_, stats) = diff(vec![data.clone()], vec![data], DiffOptions::default());
        assert_eq!(stats.transpositions, 1);
        assert_eq!(stats.block_files, 0);
        assert_eq!(stats.fresh_bytes, 0);
        assert_eq!(stats.reused_bytes, BLOCK_SIZE as u64 + 10);
    }

    #[test]
    fn test_partial_copy_is_not_a_transposition() {
        let data = noise(3 * BLOCK_SIZE, 7);
        let options = DiffOptions {
            suffix: false,
            ..DiffOptions::default()
        };
        let (_, stats) = diff(vec![data.clone()], vec![data[..BLOCK_SIZE].to_vec()], options);
        assert_eq!(stats.transpositions, 0);
        assert_eq!(stats.block_files, 1);
    }

    #[test]
    fn test_edited_file_goes_through_suffix_diff() {
        let old = noise(200_000, 2);
        let mut new = old.clone();
        new[100_000] ^= 0xff;
        let (patch, stats) = diff(vec![old], vec![new], DiffOptions::default());
        assert_eq!(stats.suffix_files, 1);

        let (mut reader, _) =
            WireReader::open(Cursor::new(patch), PATCH_MAGIC, "patch").unwrap();
        let _: Container = reader.read_message().unwrap();
        let _: Container = reader.read_message().unwrap();
        let header: SyncHeader = reader.read_message().unwrap();
        assert_eq!(header.algorithm().unwrap(), Algorithm::SuffixDiff);
        let suffix: SuffixHeader = reader.read_message().unwrap();
        assert_eq!(suffix.target_index, 0);
    }

    #[test]
    fn test_without_suffix_everything_is_block_diffed() {
        let old = noise(200_000, 3);
        let mut new = old.clone();
        new[5] ^= 1;
        let options = DiffOptions {
            suffix: false,
            ..DiffOptions::default()
        };
        let (_, stats) = diff(vec![old], vec![new.clone(), noise(100, 4)], options);
        assert_eq!(stats.suffix_files, 0);
        assert_eq!(stats.block_files, 2);
        assert_eq!(stats.fresh_bytes + stats.reused_bytes, new.len() as u64 + 100);
    }

    #[test]
    fn test_output_ignores_worker_count() {
        let old = noise(300_000, 5);
        let mut new = old[1000..].to_vec();
        new.extend_from_slice(&noise(5000, 6));
        let run = |workers| {
            let options = DiffOptions {
                partitions: 4,
                workers,
                ..DiffOptions::default()
            };
            diff(vec![old.clone()], vec![new.clone()], options).0
        };
        assert_eq!(run(1), run(8));
    }
}
