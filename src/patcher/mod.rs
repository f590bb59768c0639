//! Resumable patch application.
//!
//! The [`Patcher`] walks the new container file by file. Each file is either
//! a transposition (handed to the bowl whole), a block-diff stream, or a
//! suffix-diff stream. Between any two messages the patcher can hand a
//! [`Checkpoint`] to its [`SaveConsumer`], which may ask it to stop.

mod block;
mod checkpoint;
mod suffix;

pub use checkpoint::{
    fingerprint, AfterSave, Checkpoint, FileCheckpoint, NopSaveConsumer, SaveConsumer,
    TimedSaveConsumer,
};

use crate::bowl::{Bowl, EntryWriter, WriterCheckpoint};
use crate::container::Container;
use crate::delta::{BlockApplier, BLOCK_SIZE};
use crate::error::{format_bytes, PatchError, Result};
use crate::pool::Pool;
use crate::progress::{NopProgress, ProgressSink};
use crate::protocol::{Algorithm, MessageRead, PatchHeader, SyncHeader, WireReader, PATCH_MAGIC};
use crate::suffix::ControlApplier;
use std::io::{Read, Seek};
use tracing::Level;

/// How a call to [`Patcher::resume`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Every file was handed to the bowl
    Completed,
    /// The save consumer asked to stop after a checkpoint
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub transpositions: u64,
    pub block_files: u64,
    pub suffix_files: u64,
    pub bytes_written: u64,
    pub checkpoints: u64,
}

pub struct Patcher<M> {
    reader: M,
    header: PatchHeader,
    target: Container,
    source: Container,
    fingerprint: u64,
    block_applier: BlockApplier,
    save_consumer: Box<dyn SaveConsumer>,
    progress: Box<dyn ProgressSink>,
    stats: PatchStats,
}

enum PatchState {
    AtFileBoundary(usize),
    ReadingSyncHeader(usize),
    Streaming(ActiveFile),
    Finalizing(ActiveFile),
    Done,
}

/// Result of feeding one message to a file's applier
enum StreamStep {
    More,
    Finished,
}

enum FileStream {
    Block,
    Suffix {
        target_index: usize,
        applier: ControlApplier,
    },
}

/// A new file whose writer is open
struct ActiveFile {
    index: usize,
    size: u64,
    /// Offset of the file in the new container, for progress
    container_offset: u64,
    writer: Box<dyn EntryWriter>,
    stream: FileStream,
}

impl Drop for ActiveFile {
    fn drop(&mut self) {
        if let Err(e) = self.writer.close() {
            tracing::debug!("Closing writer for file #{}: {}", self.index, e);
        }
    }
}

impl<R: Read + Seek> Patcher<WireReader<R>> {
    /// Open a patch stream and read both containers
    pub fn open(patch: R) -> Result<Self> {
        let (reader, header) = WireReader::open(patch, PATCH_MAGIC, "patch")?;
        Self::new(reader, header)
    }
}

impl<M: MessageRead> Patcher<M> {
    /// Reads the old and new containers right away; resuming needs them too.
    pub fn new(mut reader: M, header: PatchHeader) -> Result<Self> {
        let target: Container = reader.read_message()?;
        let source: Container = reader.read_message()?;
        let fingerprint = fingerprint(&target, &source)?;
        tracing::debug!(
            "Patch ({}): old tree {}, new tree {}",
            header.compression,
            target.stats(),
            source.stats()
        );
        Ok(Self {
            reader,
            header,
            target,
            source,
            fingerprint,
            block_applier: BlockApplier::new(BLOCK_SIZE),
            save_consumer: Box::new(NopSaveConsumer),
            progress: Box::new(NopProgress),
            stats: PatchStats::default(),
        })
    }

    /// Strict mode (default) fails on unreadable old blocks; otherwise they
    /// are replaced with zeros.
    pub fn set_strict(&mut self, strict: bool) {
        self.block_applier.set_strict(strict);
    }

    pub fn set_save_consumer(&mut self, consumer: Box<dyn SaveConsumer>) {
        self.save_consumer = consumer;
    }

    pub fn set_progress(&mut self, progress: Box<dyn ProgressSink>) {
        self.progress = progress;
    }

    pub fn header(&self) -> &PatchHeader {
        &self.header
    }

    /// The old tree the patch applies to
    pub fn target_container(&self) -> &Container {
        &self.target
    }

    /// The new tree the patch produces
    pub fn source_container(&self) -> &Container {
        &self.source
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn stats(&self) -> &PatchStats {
        &self.stats
    }

    /// Apply the patch from the start, or from `checkpoint`.
    ///
    /// The target pool is closed before returning, whatever the outcome.
    /// The bowl is not committed; that is up to the caller.
    pub fn resume(
        &mut self,
        checkpoint: Option<&Checkpoint>,
        target_pool: &mut dyn Pool,
        bowl: &mut dyn Bowl,
    ) -> Result<ResumeOutcome> {
        let result = self.run(checkpoint, target_pool, bowl);
        let closed = target_pool.close();
        let outcome = result?;
        closed?;
        Ok(outcome)
    }

    fn run(
        &mut self,
        checkpoint: Option<&Checkpoint>,
        target_pool: &mut dyn Pool,
        bowl: &mut dyn Bowl,
    ) -> Result<ResumeOutcome> {
        let mut state = match checkpoint {
            Some(checkpoint) => self.restore(checkpoint, bowl)?,
            None => {
                bowl.resume(None)?;
                PatchState::AtFileBoundary(0)
            }
        };

        loop {
            state = match state {
                PatchState::AtFileBoundary(index) if index >= self.source.files.len() => {
                    PatchState::Done
                }
                PatchState::AtFileBoundary(index) => {
                    if self.save_consumer.should_save()
                        && self.save(index, None, bowl)? == AfterSave::Stop
                    {
                        return Ok(ResumeOutcome::Stopped);
                    }
                    PatchState::ReadingSyncHeader(index)
                }
                PatchState::ReadingSyncHeader(index) => {
                    self.start_file(index, target_pool, bowl)?
                }
                PatchState::Streaming(mut active) => {
                    let step = match &mut active.stream {
                        FileStream::Block => self.step_block(
                            &mut active.writer,
                            active.size,
                            active.index,
                            target_pool,
                        )?,
                        FileStream::Suffix {
                            target_index,
                            applier,
                        } => self.step_suffix(
                            *target_index,
                            applier,
                            &mut active.writer,
                            active.size,
                            target_pool,
                        )?,
                    };
                    match step {
                        StreamStep::Finished => PatchState::Finalizing(active),
                        StreamStep::More => {
                            self.report_progress(&active);
                            if self.save_consumer.should_save()
                                && self.save(active.index, Some(&mut active), bowl)?
                                    == AfterSave::Stop
                            {
                                return Ok(ResumeOutcome::Stopped);
                            }
                            PatchState::Streaming(active)
                        }
                    }
                }
                PatchState::Finalizing(mut active) => {
                    self.finish_file(&mut active)?;
                    PatchState::AtFileBoundary(active.index + 1)
                }
                PatchState::Done => break,
            };
        }

        self.progress.progress(1.0);
        tracing::debug!(
            "Patch applied: {} transpositions, {} block-diff files, {} suffix-diff files, {} written",
            self.stats.transpositions,
            self.stats.block_files,
            self.stats.suffix_files,
            format_bytes(self.stats.bytes_written)
        );
        Ok(ResumeOutcome::Completed)
    }

    /// Validate a checkpoint and rebuild the state it describes
    fn restore(&mut self, checkpoint: &Checkpoint, bowl: &mut dyn Bowl) -> Result<PatchState> {
        if checkpoint.fingerprint != self.fingerprint {
            return Err(PatchError::CheckpointMismatch(format!(
                "checkpoint fingerprint {:016x} does not match patch {:016x}",
                checkpoint.fingerprint, self.fingerprint
            )));
        }
        let file_count = self.source.files.len();
        let index = checkpoint.file_index;
        if index > file_count || (index == file_count && checkpoint.file.is_some()) {
            return Err(PatchError::CheckpointMismatch(format!(
                "checkpoint refers to file #{} but the patch has {} files",
                index, file_count
            )));
        }

        self.reader.resume(Some(&checkpoint.message))?;
        bowl.resume(Some(&checkpoint.bowl))?;
        let position = match self.source.files.get(index) {
            Some(entry) => format!("{} (file {} of {})", entry.path, index + 1, file_count),
            None => "the end of the patch".to_string(),
        };
        self.progress.log(Level::INFO, &format!("Resuming at {}", position));
        tracing::debug!("Resuming after message {}", checkpoint.message.messages_read);

        match &checkpoint.file {
            // Saved before the sync header; skip the boundary so resuming
            // always makes progress
            None if index == file_count => Ok(PatchState::Done),
            None => Ok(PatchState::ReadingSyncHeader(index)),
            Some(FileCheckpoint::BlockDiff { writer }) => {
                let active = self.open_file(index, FileStream::Block, Some(writer), bowl)?;
                Ok(PatchState::Streaming(active))
            }
            Some(FileCheckpoint::SuffixDiff {
                writer,
                target_index,
                old_offset,
            }) => {
                if *target_index >= self.target.files.len() {
                    return Err(PatchError::CheckpointMismatch(format!(
                        "checkpoint reads old file #{} but the old tree has {} files",
                        target_index,
                        self.target.files.len()
                    )));
                }
                let stream = FileStream::Suffix {
                    target_index: *target_index,
                    applier: ControlApplier::resume(*old_offset, writer.offset),
                };
                let active = self.open_file(index, stream, Some(writer), bowl)?;
                Ok(PatchState::Streaming(active))
            }
        }
    }

    fn start_file(
        &mut self,
        index: usize,
        target_pool: &mut dyn Pool,
        bowl: &mut dyn Bowl,
    ) -> Result<PatchState> {
        let header: SyncHeader = self.reader.read_message()?;
        if header.file_index != index as u64 {
            return Err(PatchError::Corrupt(format!(
                "expected sync header for file #{}, found #{}",
                index, header.file_index
            )));
        }
        match header.algorithm()? {
            Algorithm::BlockDiff => self.start_block_file(index, target_pool, bowl),
            Algorithm::SuffixDiff => self.start_suffix_file(index, bowl),
        }
    }

    /// Get a writer for new file `index` and position it
    fn open_file(
        &mut self,
        index: usize,
        stream: FileStream,
        checkpoint: Option<&WriterCheckpoint>,
        bowl: &mut dyn Bowl,
    ) -> Result<ActiveFile> {
        let entry = self.source.file(index)?;
        self.progress.progress_label(&entry.path);
        let mut active = ActiveFile {
            index,
            size: entry.size,
            container_offset: entry.offset,
            writer: bowl.get_writer(index)?,
            stream,
        };

        let offset = active.writer.resume(checkpoint)?;
        let expected = checkpoint.map_or(0, |c| c.offset);
        if offset != expected {
            return Err(PatchError::CheckpointMismatch(format!(
                "writer for {} resumed at byte {} instead of {}",
                entry.path, offset, expected
            )));
        }
        Ok(active)
    }

    fn finish_file(&mut self, active: &mut ActiveFile) -> Result<()> {
        let written = active.writer.tell();
        if written != active.size {
            return Err(PatchError::SizeMismatch {
                path: self.source.file(active.index)?.path.clone(),
                expected: active.size,
                actual: written,
            });
        }
        active.writer.finalize()?;
        active.writer.close()?;

        match active.stream {
            FileStream::Block => self.stats.block_files += 1,
            FileStream::Suffix { .. } => self.stats.suffix_files += 1,
        }
        self.stats.bytes_written += written;
        tracing::trace!("File #{} done ({})", active.index, format_bytes(written));
        Ok(())
    }

    /// Checkpoint at the next unread message and hand it to the consumer
    fn save(
        &mut self,
        file_index: usize,
        active: Option<&mut ActiveFile>,
        bowl: &mut dyn Bowl,
    ) -> Result<AfterSave> {
        self.reader.want_save();
        let message = self.reader.pop_checkpoint().ok_or_else(|| {
            PatchError::InvalidInput("message reader did not produce a checkpoint".into())
        })?;
        let bowl_checkpoint = bowl.save()?;
        let file = match active {
            None => None,
            Some(active) => {
                let writer = active.writer.save()?;
                Some(match &active.stream {
                    FileStream::Block => FileCheckpoint::BlockDiff { writer },
                    FileStream::Suffix {
                        target_index,
                        applier,
                    } => FileCheckpoint::SuffixDiff {
                        writer,
                        target_index: *target_index,
                        old_offset: applier.old_offset(),
                    },
                })
            }
        };

        self.stats.checkpoints += 1;
        self.save_consumer.save(Checkpoint {
            fingerprint: self.fingerprint,
            file_index,
            message,
            file,
            bowl: bowl_checkpoint,
        })
    }

    fn report_progress(&self, active: &ActiveFile) {
        if self.source.size > 0 {
            let done = active.container_offset + active.writer.tell();
            self.progress.progress(done as f64 / self.source.size as f64);
        }
    }
}
