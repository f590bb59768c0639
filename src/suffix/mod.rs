//! Whole-file binary diffing over a suffix array (bsdiff family).
//!
//! The old buffer is suffix-sorted in independent partitions, the new buffer
//! is scanned in independent blocks, and the matches are turned into
//! [`Control`] triples in block order. Output is identical for any worker count.

mod diff;
mod partitioned;
mod patch;
mod sais;

pub use diff::{SuffixDiffStats, SuffixDiffer};
pub use partitioned::PartitionedSuffixArray;
pub use patch::ControlApplier;
pub use sais::suffix_array;

use serde::{Deserialize, Serialize};

/// Largest old buffer that can be suffix-sorted (indices are `i32`)
pub const MAX_SUFFIX_INPUT: usize = i32::MAX as usize;

/// One bsdiff instruction: add, then copy, then move the old cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    /// Byte-wise deltas, added (mod 256) to old bytes at the cursor
    pub add: Vec<u8>,
    /// Literal bytes
    pub copy: Vec<u8>,
    /// Signed move of the old cursor after `add` is consumed
    pub seek: i64,
    /// End of the control stream for this file
    pub eof: bool,
}

impl Control {
    pub fn eof() -> Self {
        Self {
            eof: true,
            ..Self::default()
        }
    }

    /// New bytes this control produces
    pub fn output_len(&self) -> u64 {
        (self.add.len() + self.copy.len()) as u64
    }
}

/// Reusable work memory for suffix sorting.
///
/// Owned by the caller and passed into every diff so repeated diffs don't
/// reallocate; grows to the largest old buffer seen.
#[derive(Debug, Default)]
pub struct SuffixScratch {
    pub(crate) sa: Vec<i32>,
}

impl SuffixScratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently held
    pub fn capacity_bytes(&self) -> usize {
        self.sa.capacity() * std::mem::size_of::<i32>()
    }

    pub(crate) fn suffix_array_buffer(&mut self, len: usize) -> &mut [i32] {
        if self.sa.len() < len {
            tracing::debug!("Growing suffix scratch from {} to {} entries", self.sa.len(), len);
            self.sa.resize(len, 0);
        }
        &mut self.sa[..len]
    }
}
