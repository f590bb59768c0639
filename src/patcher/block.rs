use super::{FileStream, PatchState, Patcher, StreamStep};
use crate::bowl::{Bowl, EntryWriter, Transposition};
use crate::delta::{num_blocks, BLOCK_SIZE};
use crate::error::{PatchError, Result};
use crate::pool::Pool;
use crate::protocol::{MessageRead, SyncOp};

impl<M: MessageRead> Patcher<M> {
    /// Read the first op of a block-diff file; a single op covering an old
    /// file of the same size turns the whole file into a transposition.
    pub(super) fn start_block_file(
        &mut self,
        index: usize,
        target_pool: &mut dyn Pool,
        bowl: &mut dyn Bowl,
    ) -> Result<PatchState> {
        let first: SyncOp = self.reader.read_message()?;

        if let Some(target_index) = self.transposition_target(index, &first)? {
            let next: SyncOp = self.reader.read_message()?;
            if next != SyncOp::Sentinel {
                return Err(PatchError::unexpected(
                    next.kind(),
                    format!("expecting the sentinel after transposing file #{}", index),
                ));
            }
            tracing::debug!(
                "Transposing old {} to new {}",
                self.target.files[target_index].path,
                self.source.files[index].path
            );
            bowl.transpose(
                Transposition {
                    source_index: index,
                    target_index,
                },
                target_pool,
            )?;
            self.stats.transpositions += 1;
            return Ok(PatchState::AtFileBoundary(index + 1));
        }

        let mut active = self.open_file(index, FileStream::Block, None, bowl)?;
        match first {
            SyncOp::Sentinel => Ok(PatchState::Finalizing(active)),
            op => {
                self.apply_sync_op(op, &mut active.writer, active.size, index, target_pool)?;
                Ok(PatchState::Streaming(active))
            }
        }
    }

    pub(super) fn step_block(
        &mut self,
        writer: &mut Box<dyn EntryWriter>,
        size: u64,
        index: usize,
        target_pool: &mut dyn Pool,
    ) -> Result<StreamStep> {
        let op: SyncOp = self.reader.read_message()?;
        if op == SyncOp::Sentinel {
            return Ok(StreamStep::Finished);
        }
        self.apply_sync_op(op, writer, size, index, target_pool)?;
        Ok(StreamStep::More)
    }

    fn apply_sync_op(
        &mut self,
        op: SyncOp,
        writer: &mut Box<dyn EntryWriter>,
        size: u64,
        index: usize,
        target_pool: &mut dyn Pool,
    ) -> Result<()> {
        let Some(op) = op.into_operation() else {
            return Ok(());
        };
        self.block_applier.apply(&op, target_pool, writer)?;
        let written = writer.tell();
        if written > size {
            return Err(PatchError::SizeMismatch {
                path: self.source.file(index)?.path.clone(),
                expected: size,
                actual: written,
            });
        }
        Ok(())
    }

    fn transposition_target(&self, index: usize, op: &SyncOp) -> Result<Option<usize>> {
        let SyncOp::BlockRange {
            file_index,
            block_index: 0,
            block_span,
        } = op
        else {
            return Ok(None);
        };
        let target_index = *file_index as usize;
        let target = self.target.file(target_index)?;
        let size = self.source.file(index)?.size;
        let whole = size > 0 && *block_span == num_blocks(size, BLOCK_SIZE);
        Ok((whole && target.size == size).then_some(target_index))
    }
}
