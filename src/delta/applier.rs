use super::{range_len, Operation};
use crate::error::{PatchError, Result};
use crate::pool::Pool;
use std::io::{self, Read, Seek, SeekFrom, Write};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Replays [`Operation`]s against a pool of old files.
///
/// In strict mode (the default) any failure to read an old file is fatal.
/// In best-effort mode the missing bytes are replaced with zeros so the
/// output keeps its expected size.
pub struct BlockApplier {
    block_size: usize,
    strict: bool,
    buffer: Vec<u8>,
}

impl BlockApplier {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            strict: true,
            buffer: vec![0u8; COPY_BUFFER_SIZE],
        }
    }

    pub fn best_effort(mut self) -> Self {
        self.strict = false;
        self
    }

    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    /// Apply one op, returning the number of bytes written to `out`
    pub fn apply(
        &mut self,
        op: &Operation,
        pool: &mut dyn Pool,
        out: &mut dyn Write,
    ) -> Result<u64> {
        match op {
            Operation::Data(data) => {
                out.write_all(data)?;
                Ok(data.len() as u64)
            }
            Operation::BlockRange {
                file_index,
                block_index,
                block_span,
            } => {
                let file_size = pool.get_size(*file_index)?;
                let len = range_len(file_size, self.block_size, *block_index, *block_span);
                let offset = block_index.saturating_mul(self.block_size as u64);

                match self.copy_range(pool, *file_index, offset, len, out) {
                    Ok(()) => Ok(len),
                    Err(CopyError::Output(e)) => Err(e.into()),
                    Err(CopyError::Source { copied, error }) => {
                        if self.strict {
                            return Err(match error {
                                PatchError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                                    PatchError::Corrupt(format!(
                                        "old file #{} is shorter than its declared {} bytes",
                                        file_index, file_size
                                    ))
                                }
                                other => other,
                            });
                        }
                        tracing::warn!(
                            "Could not read old file #{} at offset {}: {}; writing {} zero bytes",
                            file_index,
                            offset + copied,
                            error,
                            len - copied
                        );
                        write_zeros(out, len - copied, &mut self.buffer)?;
                        Ok(len)
                    }
                }
            }
        }
    }

    fn copy_range(
        &mut self,
        pool: &mut dyn Pool,
        file_index: usize,
        offset: u64,
        len: u64,
        out: &mut dyn Write,
    ) -> std::result::Result<(), CopyError> {
        let reader = pool
            .get_reader(file_index)
            .map_err(|error| CopyError::Source { copied: 0, error })?;
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| CopyError::Source {
                copied: 0,
                error: e.into(),
            })?;

        let mut copied = 0u64;
        while copied < len {
            let want = (len - copied).min(self.buffer.len() as u64) as usize;
            let chunk = &mut self.buffer[..want];
            reader.read_exact(chunk).map_err(|e| CopyError::Source {
                copied,
                error: e.into(),
            })?;
            out.write_all(chunk).map_err(CopyError::Output)?;
            copied += want as u64;
        }
        Ok(())
    }
}

enum CopyError {
    /// Reading the old file failed after `copied` bytes were written
    Source { copied: u64, error: PatchError },
    Output(io::Error),
}

fn write_zeros(out: &mut dyn Write, mut len: u64, buffer: &mut [u8]) -> Result<()> {
    buffer.fill(0);
    while len > 0 {
        let n = len.min(buffer.len() as u64) as usize;
        out.write_all(&buffer[..n])?;
        len -= n as u64;
    }
    Ok(())
}
