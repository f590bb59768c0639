//! Output strategies for a replayed patch.
//!
//! A [`Bowl`] hands out one [`EntryWriter`] per new file, records whole-file
//! [`Transposition`]s, and performs every cross-cutting filesystem effect in
//! [`Bowl::commit`].

mod discard;
mod fresh;
mod overlay;
mod pool;

pub use discard::DiscardBowl;
pub use fresh::FreshBowl;
pub use overlay::{OverlayBowl, OverlayCheckpoint};
pub use pool::PoolBowl;

use crate::error::Result;
use crate::pool::Pool;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// New file `source_index` is byte-identical to old file `target_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transposition {
    pub source_index: usize,
    pub target_index: usize,
}

/// Where a writer stopped; enough to continue after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriterCheckpoint {
    /// Bytes of the new file written so far
    pub offset: u64,
    /// Extra cursors kept by overlay writers
    pub overlay: Option<OverlayOffsets>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayOffsets {
    /// Bytes consumed from the existing file
    pub read_offset: u64,
    /// Bytes of overlay patch written to the stage file
    pub overlay_offset: u64,
}

/// Bowl-specific state bundled into a patcher checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BowlCheckpoint {
    Discard,
    Fresh,
    Overlay(OverlayCheckpoint),
}

impl BowlCheckpoint {
    pub fn kind(&self) -> &'static str {
        match self {
            BowlCheckpoint::Discard => "discard",
            BowlCheckpoint::Fresh => "fresh",
            BowlCheckpoint::Overlay(_) => "overlay",
        }
    }
}

/// Per-file output sink.
///
/// Must be resumed (with or without a checkpoint) before the first write.
pub trait EntryWriter: Write + Send {
    /// Open the entry; returns the new-file offset writing continues from
    fn resume(&mut self, checkpoint: Option<&WriterCheckpoint>) -> Result<u64>;

    /// Make everything written so far durable and describe the position
    fn save(&mut self) -> Result<WriterCheckpoint>;

    /// Bytes of the new file written so far
    fn tell(&self) -> u64;

    /// The entry is complete
    fn finalize(&mut self) -> Result<()>;

    /// Release handles; safe to call more than once
    fn close(&mut self) -> Result<()>;
}

pub trait Bowl {
    /// Short name used in logs and errors
    fn name(&self) -> &'static str;

    fn get_writer(&mut self, source_index: usize) -> Result<Box<dyn EntryWriter>>;

    /// Declare that a new file reuses an old file verbatim
    fn transpose(&mut self, transposition: Transposition, target_pool: &mut dyn Pool) -> Result<()>;

    fn save(&mut self) -> Result<BowlCheckpoint>;

    fn resume(&mut self, checkpoint: Option<&BowlCheckpoint>) -> Result<()>;

    /// Apply every recorded effect. Re-running after a failure is safe.
    fn commit(&mut self) -> Result<()>;
}

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Stream an old file into `out`, checking the length against the pool.
pub(crate) fn copy_from_pool(
    target_pool: &mut dyn Pool,
    target_index: usize,
    out: &mut dyn Write,
) -> Result<u64> {
    let expected = target_pool.get_size(target_index)?;
    let reader = target_pool.get_reader(target_index)?;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        out.write_all(&buf[..n])?;
        copied += n as u64;
    }
    out.flush()?;
    if copied != expected {
        return Err(crate::error::PatchError::SizeMismatch {
            path: format!("old file #{}", target_index),
            expected,
            actual: copied,
        });
    }
    Ok(copied)
}

fn writer_not_resumed() -> io::Error {
    io::Error::other("entry writer used before resume")
}
