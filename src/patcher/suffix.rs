use super::{FileStream, PatchState, Patcher, StreamStep};
use crate::bowl::{Bowl, EntryWriter};
use crate::error::{PatchError, Result};
use crate::pool::Pool;
use crate::protocol::{MessageRead, SuffixHeader, SyncOp};
use crate::suffix::{Control, ControlApplier};

impl<M: MessageRead> Patcher<M> {
    pub(super) fn start_suffix_file(
        &mut self,
        index: usize,
        bowl: &mut dyn Bowl,
    ) -> Result<PatchState> {
        let header: SuffixHeader = self.reader.read_message()?;
        let target_index = usize::try_from(header.target_index)
            .ok()
            .filter(|&t| t < self.target.files.len())
            .ok_or_else(|| {
                PatchError::Corrupt(format!(
                    "file #{} is diffed against old file #{}, which does not exist",
                    index, header.target_index
                ))
            })?;
        tracing::debug!(
            "Suffix diff: {} from old {}",
            self.source.files[index].path,
            self.target.files[target_index].path
        );

        let stream = FileStream::Suffix {
            target_index,
            applier: ControlApplier::new(),
        };
        let active = self.open_file(index, stream, None, bowl)?;
        Ok(PatchState::Streaming(active))
    }

    /// Apply one control. The EOF control must be followed by the sentinel.
    pub(super) fn step_suffix(
        &mut self,
        target_index: usize,
        applier: &mut ControlApplier,
        writer: &mut Box<dyn EntryWriter>,
        size: u64,
        target_pool: &mut dyn Pool,
    ) -> Result<StreamStep> {
        let control: Control = self.reader.read_message()?;
        if control.output_len() > 0 || control.seek != 0 {
            let old = target_pool.get_reader(target_index)?;
            applier.apply(&control, old, writer, size)?;
        }
        if !control.eof {
            return Ok(StreamStep::More);
        }

        let next: SyncOp = self.reader.read_message()?;
        if next != SyncOp::Sentinel {
            return Err(PatchError::unexpected(
                next.kind(),
                "expecting the sentinel after the last control",
            ));
        }
        Ok(StreamStep::Finished)
    }
}
