use crate::error::{PatchError, Result};
use crate::patcher::Checkpoint;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const CHECKPOINT_VERSION: u32 = 1;

/// On-disk record of an interrupted `apply`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    version: u32,
    pub patch: PathBuf,
    pub output: PathBuf,
    pub started_at: String,
    pub checkpoint_at: String,
    pub checkpoint: Checkpoint,
}

impl CheckpointFile {
    pub fn new(patch: PathBuf, output: PathBuf, checkpoint: Checkpoint) -> Self {
        let now = format_timestamp(SystemTime::now());
        Self {
            version: CHECKPOINT_VERSION,
            patch,
            output,
            started_at: now.clone(),
            checkpoint_at: now,
            checkpoint,
        }
    }

    /// Load a checkpoint file. Missing files and files from another version
    /// yield `None`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        tracing::debug!("Loading checkpoint from {}", path.display());
        let file = File::open(path).map_err(|e| {
            PatchError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to open checkpoint file: {}", e),
            ))
        })?;

        let state: Self = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            tracing::warn!("Failed to parse checkpoint file: {}", e);
            PatchError::CheckpointMismatch(format!("corrupted checkpoint file: {}", e))
        })?;

        if state.version != CHECKPOINT_VERSION {
            tracing::warn!(
                "Checkpoint version mismatch: expected {}, got {}",
                CHECKPOINT_VERSION,
                state.version
            );
            return Ok(None);
        }

        Ok(Some(state))
    }

    /// Save atomically (temp file, then rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        tracing::trace!("Saving checkpoint to {}", path.display());
        let file = File::create(&temp_path).map_err(|e| {
            PatchError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create temp checkpoint file: {}", e),
            ))
        })?;

        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self).map_err(|e| {
            PatchError::Io(std::io::Error::other(format!(
                "Failed to write checkpoint file: {}",
                e
            )))
        })?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        std::fs::rename(&temp_path, path).map_err(|e| {
            PatchError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to save checkpoint file: {}", e),
            ))
        })?;
        Ok(())
    }

    pub fn delete(path: &Path) -> Result<()> {
        if path.exists() {
            tracing::debug!("Deleting checkpoint file {}", path.display());
            std::fs::remove_file(path).map_err(|e| {
                PatchError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to delete checkpoint file: {}", e),
                ))
            })?;
        }
        Ok(())
    }

    /// Replace the checkpoint and bump the timestamp
    pub fn update(&mut self, checkpoint: Checkpoint) {
        self.checkpoint = checkpoint;
        self.checkpoint_at = format_timestamp(SystemTime::now());
    }

    /// True if this checkpoint was taken applying `patch` into `output`
    pub fn is_compatible_with(&self, patch: &Path, output: &Path) -> bool {
        self.patch == patch && self.output == output
    }
}

/// RFC 3339 timestamp
fn format_timestamp(time: SystemTime) -> String {
    let datetime: chrono::DateTime<chrono::Utc> = time.into();
    datetime.to_rfc3339()
}
