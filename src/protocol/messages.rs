use crate::compress::CompressionSettings;
use crate::delta::{Operation, StrongHash};
use crate::error::{PatchError, Result};
use serde::{Deserialize, Serialize};

/// "SWP1"
pub const PATCH_MAGIC: u32 = 0x3150_5753;
/// "SWS1"
pub const SIGNATURE_MAGIC: u32 = 0x3153_5753;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchHeader {
    pub compression: CompressionSettings,
}

/// How a new file is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    BlockDiff,
    SuffixDiff,
}

impl Algorithm {
    pub fn tag(self) -> u32 {
        match self {
            Algorithm::BlockDiff => 0,
            Algorithm::SuffixDiff => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::BlockDiff => "block-diff",
            Algorithm::SuffixDiff => "suffix-diff",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHeader {
    pub file_index: u64,
    /// Raw tag so unknown algorithms surface as such, not as decode errors
    pub algorithm: u32,
}

impl SyncHeader {
    pub fn new(file_index: usize, algorithm: Algorithm) -> Self {
        Self {
            file_index: file_index as u64,
            algorithm: algorithm.tag(),
        }
    }

    pub fn algorithm(&self) -> Result<Algorithm> {
        match self.algorithm {
            0 => Ok(Algorithm::BlockDiff),
            1 => Ok(Algorithm::SuffixDiff),
            tag => Err(PatchError::UnknownAlgorithm {
                file_index: self.file_index,
                tag,
            }),
        }
    }
}

/// Block-diff stream message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOp {
    BlockRange {
        file_index: u64,
        block_index: u64,
        block_span: u64,
    },
    Data(Vec<u8>),
    /// End of one file's stream
    Sentinel,
}

impl SyncOp {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncOp::BlockRange { .. } => "block range",
            SyncOp::Data(_) => "data op",
            SyncOp::Sentinel => "sentinel",
        }
    }

    /// The operation this message carries; `None` for the sentinel
    pub fn into_operation(self) -> Option<Operation> {
        match self {
            SyncOp::BlockRange {
                file_index,
                block_index,
                block_span,
            } => Some(Operation::BlockRange {
                file_index: file_index as usize,
                block_index,
                block_span,
            }),
            SyncOp::Data(data) => Some(Operation::Data(data)),
            SyncOp::Sentinel => None,
        }
    }
}

impl From<Operation> for SyncOp {
    fn from(op: Operation) -> Self {
        match op {
            Operation::BlockRange {
                file_index,
                block_index,
                block_span,
            } => SyncOp::BlockRange {
                file_index: file_index as u64,
                block_index,
                block_span,
            },
            Operation::Data(data) => SyncOp::Data(data),
        }
    }
}

/// Names the old file a suffix-diff stream reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffixHeader {
    pub target_index: u64,
}

/// One block of a signature stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHashMessage {
    pub weak: u32,
    pub strong: StrongHash,
}
