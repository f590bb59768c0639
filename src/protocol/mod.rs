//! Patch stream messages and the reader/writer boundary they travel through.
//!
//! A patch is: magic, [`PatchHeader`], old container, new container, then
//! for each new file a [`SyncHeader`] followed by that algorithm's stream.
//! Block-diff files carry [`SyncOp`]s up to a `Sentinel`; suffix-diff files
//! carry a [`SuffixHeader`], [`Control`](crate::suffix::Control)s up to an
//! EOF control, then a `Sentinel`.

mod messages;
mod wire;

pub use messages::{
    Algorithm, BlockHashMessage, PatchHeader, SuffixHeader, SyncHeader, SyncOp, PATCH_MAGIC,
    SIGNATURE_MAGIC,
};
pub use wire::{WireReader, WireWriter, FRAME_TARGET_SIZE};

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Position of the next unread message, enough to reopen the stream there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCheckpoint {
    /// Byte offset of the frame holding the next message
    pub frame_offset: u64,
    /// Offset of the next message inside the decoded frame
    pub frame_position: u64,
    pub messages_read: u64,
}

/// Source of typed messages with a resumability hook.
pub trait MessageRead {
    fn read_message<T: DeserializeOwned>(&mut self) -> Result<T>;

    /// Ask for a checkpoint at the next message boundary
    fn want_save(&mut self);

    /// Checkpoint requested by `want_save`, if any
    fn pop_checkpoint(&mut self) -> Option<MessageCheckpoint>;

    /// Reposition to a checkpoint; `None` keeps the current position
    fn resume(&mut self, checkpoint: Option<&MessageCheckpoint>) -> Result<()>;
}

/// Sink of typed messages.
pub trait MessageWrite {
    fn write_message<T: Serialize>(&mut self, message: &T) -> Result<()>;
}
