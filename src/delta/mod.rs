//! Content-defined block diffing (rsync-style).
//!
//! The old tree is cut into fixed-size blocks and summarized as a
//! [`BlockLibrary`]. The new bytes are scanned with a rolling hash and
//! expressed as [`Operation`]s: runs of old blocks plus literal data.

pub mod applier;
pub mod checksum;
pub mod generator;
pub mod rolling;

pub use applier::BlockApplier;
pub use checksum::{compute_file_signature, compute_signature, BlockHash, BlockLibrary, StrongHash};
pub use generator::BlockDiffer;
pub use rolling::RollingHash;

/// Size of a signature block. Fixed for the patch format.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Literal runs longer than this are split into several Data ops
pub const MAX_DATA_OP: usize = 4 * 1024 * 1024;

/// One reconstruction instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Copy `block_span` blocks starting at `block_index` of old file `file_index`
    BlockRange {
        file_index: usize,
        block_index: u64,
        block_span: u64,
    },
    /// Write these bytes verbatim
    Data(Vec<u8>),
}

/// Number of blocks a file of `file_size` bytes is cut into
pub fn num_blocks(file_size: u64, block_size: usize) -> u64 {
    file_size.div_ceil(block_size as u64)
}

/// Byte length of the range covered by a BlockRange, clamped to the file's end
pub fn range_len(file_size: u64, block_size: usize, block_index: u64, block_span: u64) -> u64 {
    let bs = block_size as u64;
    let start = block_index.saturating_mul(bs);
    let end = block_index
        .saturating_add(block_span)
        .saturating_mul(bs)
        .min(file_size);
    end.saturating_sub(start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_blocks() {
        assert_eq!(num_blocks(0, 4), 0);
        assert_eq!(num_blocks(1, 4), 1);
        assert_eq!(num_blocks(4, 4), 1);
        assert_eq!(num_blocks(5, 4), 2);
        assert_eq!(num_blocks(10 * 1024 * 1024, BLOCK_SIZE), 160);
    }

    #[test]
    fn test_range_len_clamps_final_block() {
        // 10 bytes in blocks of 4: [0..4) [4..8) [8..10)
        assert_eq!(range_len(10, 4, 0, 1), 4);
        assert_eq!(range_len(10, 4, 0, 3), 10);
        assert_eq!(range_len(10, 4, 2, 1), 2);
        assert_eq!(range_len(10, 4, 1, 2), 6);
        // Past the end of the file yields nothing
        assert_eq!(range_len(10, 4, 5, 1), 0);
    }
}
