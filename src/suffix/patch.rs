use super::Control;
use crate::error::{PatchError, Result};
use crate::pool::ReadSeek;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Replays [`Control`]s against one old file.
///
/// Keeps the old-file cursor and the count of new bytes written, which is
/// all the state needed to resume mid-file.
#[derive(Debug, Default)]
pub struct ControlApplier {
    old_offset: u64,
    written: u64,
    buffer: Vec<u8>,
}

impl ControlApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue from a saved cursor and output position
    pub fn resume(old_offset: u64, written: u64) -> Self {
        Self {
            old_offset,
            written,
            buffer: Vec::new(),
        }
    }

    pub fn old_offset(&self) -> u64 {
        self.old_offset
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn apply(
        &mut self,
        control: &Control,
        old: &mut dyn ReadSeek,
        out: &mut dyn Write,
        new_size: u64,
    ) -> Result<()> {
        if self.written + control.output_len() > new_size {
            return Err(PatchError::Corrupt(format!(
                "control writes past the declared size ({} + {} > {})",
                self.written,
                control.output_len(),
                new_size
            )));
        }

        if !control.add.is_empty() {
            self.buffer.resize(control.add.len(), 0);
            old.seek(SeekFrom::Start(self.old_offset))?;
            old.read_exact(&mut self.buffer).map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => PatchError::Corrupt(format!(
                    "control reads {} bytes past the end of the old file at offset {}",
                    control.add.len(),
                    self.old_offset
                )),
                _ => PatchError::Io(e),
            })?;
            for (byte, delta) in self.buffer.iter_mut().zip(&control.add) {
                *byte = byte.wrapping_add(*delta);
            }
            out.write_all(&self.buffer)?;
            self.old_offset += control.add.len() as u64;
        }

        out.write_all(&control.copy)?;
        self.written += control.output_len();

        let next = self.old_offset as i64 + control.seek;
        if next < 0 {
            return Err(PatchError::Corrupt(format!(
                "control seeks to negative old offset {}",
                next
            )));
        }
        self.old_offset = next as u64;
        Ok(())
    }
}
