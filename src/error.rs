use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad magic: expected {expected:#010x}, found {found:#010x}\nThis is not a {kind} file, or it was produced by an incompatible version.")]
    BadMagic {
        kind: &'static str,
        expected: u32,
        found: u32,
    },

    #[error("Unknown sync algorithm {tag} for file #{file_index}\nThe patch was produced by a newer or incompatible differ.")]
    UnknownAlgorithm { file_index: u64, tag: u32 },

    #[error("Size mismatch for {path}\nExpected: {expected} bytes ({expected_fmt})\nReconstructed: {actual} bytes ({actual_fmt})\nThe patch is corrupt or does not match the old tree.",
        expected_fmt = format_bytes(*expected),
        actual_fmt = format_bytes(*actual))]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Unexpected {found} while {context}")]
    UnexpectedOp {
        context: String,
        found: &'static str,
    },

    #[error("Patch stream truncated at byte {offset} while {context}\nThe file was cut short (incomplete download?).")]
    Truncated { offset: u64, context: String },

    #[error("Corrupt patch: {0}")]
    Corrupt(String),

    #[error("Failed to decode message: {0}")]
    Decode(#[from] bincode::Error),

    #[error("Checkpoint does not match this patch: {0}\nDelete the checkpoint file to start over.")]
    CheckpointMismatch(String),

    #[error("Checkpointing is not supported by the {0} bowl")]
    UnsupportedCheckpoint(&'static str),

    #[error("Commit failed on {path}\nCause: {source}\nThe destination can be committed again once the cause is fixed.")]
    Commit {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PatchError {
    /// True for errors that mean the patch (or checkpoint) itself is malformed,
    /// as opposed to an environment failure that may go away on retry.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            PatchError::BadMagic { .. }
                | PatchError::UnknownAlgorithm { .. }
                | PatchError::SizeMismatch { .. }
                | PatchError::UnexpectedOp { .. }
                | PatchError::Truncated { .. }
                | PatchError::Corrupt(_)
                | PatchError::Decode(_)
                | PatchError::CheckpointMismatch(_)
        )
    }

    pub(crate) fn unexpected(found: &'static str, context: impl Into<String>) -> Self {
        PatchError::UnexpectedOp {
            context: context.into(),
            found,
        }
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// Format bytes for human-readable display in error messages
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
