//! Compute and apply resumable binary patches between two file trees.
//!
//! [`diff::DiffContext`] writes a patch from an old tree to a new one.
//! [`patcher::Patcher`] replays it into a [`bowl::Bowl`], saving
//! [`patcher::Checkpoint`]s it can later resume from.

pub mod bowl;
pub mod compress;
pub mod config;
pub mod container;
pub mod delta;
pub mod diff;
pub mod error;
pub mod patcher;
pub mod pool;
pub mod progress;
pub mod protocol;
pub mod resume;
pub mod signature;
pub mod suffix;
