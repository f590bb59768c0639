//! In-place patching of an existing tree.
//!
//! Every write lands in a stage directory first: new paths as plain files,
//! existing paths as overlay patches against the current bytes. Nothing in
//! the output tree changes until [`Bowl::commit`].

mod commit;
mod writer;

use self::commit::Committer;
use self::writer::OverlayWriter;
use super::fresh::FileEntryWriter;
use super::{
    writer_not_resumed, Bowl, BowlCheckpoint, EntryWriter, OverlayOffsets, Transposition,
    WriterCheckpoint,
};
use crate::container::Container;
use crate::error::{PatchError, Result};
use crate::pool::Pool;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Everything the overlay bowl must remember across a restart.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OverlayCheckpoint {
    pub transpositions: Vec<Transposition>,
    /// New files staged as overlay patches
    pub overlay_files: Vec<usize>,
    /// New files staged whole, to be moved into place
    pub move_files: Vec<usize>,
}

pub struct OverlayBowl {
    target: Container,
    source: Container,
    output_dir: PathBuf,
    stage_dir: PathBuf,
    target_by_path: HashMap<String, usize>,
    state: OverlayCheckpoint,
    leftover_dirs: Vec<PathBuf>,
    committed: bool,
}

impl OverlayBowl {
    /// `output_dir` holds the old tree (`target`) and will end up holding
    /// the new one (`source`).
    pub fn new(
        target: Container,
        source: Container,
        output_dir: impl Into<PathBuf>,
        stage_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let output_dir = output_dir.into();
        let stage_dir = stage_dir.into();
        if !output_dir.is_dir() {
            return Err(PatchError::InvalidInput(format!(
                "{} must be an existing directory",
                output_dir.display()
            )));
        }
        fs::create_dir_all(&stage_dir)?;

        let target_by_path = target
            .files
            .iter()
            .enumerate()
            .map(|(i, f)| (f.path.clone(), i))
            .collect();

        Ok(Self {
            target,
            source,
            output_dir,
            stage_dir,
            target_by_path,
            state: OverlayCheckpoint::default(),
            leftover_dirs: Vec::new(),
            committed: false,
        })
    }

    pub fn stage_dir(&self) -> &Path {
        &self.stage_dir
    }

    /// Ghost directories the last commit could not remove
    pub fn leftover_dirs(&self) -> &[PathBuf] {
        &self.leftover_dirs
    }

    /// Adopt the state of a commit that failed part way through.
    ///
    /// Returns `true` when such a commit is pending. The old tree may then
    /// be partly replaced, so patching must not run again; call
    /// [`Bowl::commit`] to finish.
    pub fn resume_pending_commit(&mut self) -> Result<bool> {
        match commit::pending_state(&self.stage_dir)? {
            Some(state) => {
                tracing::info!(
                    "Found an interrupted commit into {}",
                    self.output_dir.display()
                );
                self.state = state;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn mark(list: &mut Vec<usize>, index: usize) {
        if !list.contains(&index) {
            list.push(index);
        }
    }
}

impl Bowl for OverlayBowl {
    fn name(&self) -> &'static str {
        "overlay"
    }

    fn get_writer(&mut self, source_index: usize) -> Result<Box<dyn EntryWriter>> {
        let file = self.source.file(source_index)?;
        let stage_path = self.source.entry_path(&self.stage_dir, &file.path)?;

        if let Some(&target_index) = self.target_by_path.get(&file.path) {
            tracing::trace!("Overlay writer for {}", file.path);
            let target_path = &self.target.file(target_index)?.path;
            let original_path = self.target.entry_path(&self.output_dir, target_path)?;
            Self::mark(&mut self.state.overlay_files, source_index);
            return Ok(Box::new(OverlayEntryWriter {
                stage_path,
                original_path,
                overlay: None,
                offset: 0,
            }));
        }

        tracing::trace!("Staged writer for new file {}", file.path);
        let mode = file.mode;
        Self::mark(&mut self.state.move_files, source_index);
        Ok(Box::new(FileEntryWriter::new(stage_path, mode)))
    }

    fn transpose(&mut self, transposition: Transposition, _target_pool: &mut dyn Pool) -> Result<()> {
        // A resumed patch may repeat a transposition
        match self
            .state
            .transpositions
            .iter_mut()
            .find(|t| t.source_index == transposition.source_index)
        {
            Some(existing) => *existing = transposition,
            None => self.state.transpositions.push(transposition),
        }
        Ok(())
    }

    fn save(&mut self) -> Result<BowlCheckpoint> {
        Ok(BowlCheckpoint::Overlay(self.state.clone()))
    }

    fn resume(&mut self, checkpoint: Option<&BowlCheckpoint>) -> Result<()> {
        match checkpoint {
            None => Ok(()),
            Some(BowlCheckpoint::Overlay(state)) => {
                self.state = state.clone();
                Ok(())
            }
            Some(other) => Err(PatchError::CheckpointMismatch(format!(
                "{} checkpoint given to the overlay bowl",
                other.kind()
            ))),
        }
    }

    fn commit(&mut self) -> Result<()> {
        if self.committed {
            tracing::debug!("{} already committed", self.output_dir.display());
            return Ok(());
        }
        let committer = Committer {
            source: &self.source,
            target: &self.target,
            output_dir: &self.output_dir,
            stage_dir: &self.stage_dir,
            state: &self.state,
        };
        self.leftover_dirs = committer.run()?;
        self.committed = true;
        tracing::debug!(
            "Committed {} transpositions, {} new files, {} overlays into {}",
            self.state.transpositions.len(),
            self.state.move_files.len(),
            self.state.overlay_files.len(),
            self.output_dir.display()
        );
        Ok(())
    }
}

type StageOverlay = OverlayWriter<BufReader<File>, BufWriter<File>>;

struct OverlayEntryWriter {
    stage_path: PathBuf,
    original_path: PathBuf,
    overlay: Option<StageOverlay>,
    offset: u64,
}

impl Write for OverlayEntryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let overlay = self.overlay.as_mut().ok_or_else(writer_not_resumed)?;
        let n = overlay.write(buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.overlay.as_mut() {
            Some(overlay) => overlay.flush(),
            None => Ok(()),
        }
    }
}

impl EntryWriter for OverlayEntryWriter {
    fn resume(&mut self, checkpoint: Option<&WriterCheckpoint>) -> Result<u64> {
        if let Some(parent) = self.stage_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.stage_path)?;

        let (offset, offsets) = match checkpoint {
            None => (
                0,
                OverlayOffsets {
                    read_offset: 0,
                    overlay_offset: 0,
                },
            ),
            Some(WriterCheckpoint {
                offset,
                overlay: Some(offsets),
            }) => (*offset, *offsets),
            Some(_) => {
                return Err(PatchError::CheckpointMismatch(
                    "overlay writer checkpoint lacks overlay offsets".into(),
                ))
            }
        };

        file.set_len(offsets.overlay_offset)?;
        file.seek(SeekFrom::Start(offsets.overlay_offset))?;
        let mut original = BufReader::new(File::open(&self.original_path)?);
        original.seek(SeekFrom::Start(offsets.read_offset))?;
        if offset > 0 {
            tracing::debug!(
                "Resuming overlay for {} at byte {} (read {}, patch {})",
                self.original_path.display(),
                offset,
                offsets.read_offset,
                offsets.overlay_offset
            );
        }

        self.overlay = Some(OverlayWriter::new(
            original,
            offsets.read_offset,
            BufWriter::new(file),
            offsets.overlay_offset,
        ));
        self.offset = offset;
        Ok(offset)
    }

    fn save(&mut self) -> Result<WriterCheckpoint> {
        let overlay = self.overlay.as_mut().ok_or_else(writer_not_resumed)?;
        overlay.flush()?;
        overlay.get_ref().get_ref().sync_data()?;
        Ok(WriterCheckpoint {
            offset: self.offset,
            overlay: Some(OverlayOffsets {
                read_offset: overlay.read_offset(),
                overlay_offset: overlay.write_offset(),
            }),
        })
    }

    fn tell(&self) -> u64 {
        self.offset
    }

    fn finalize(&mut self) -> Result<()> {
        let overlay = self.overlay.take().ok_or_else(writer_not_resumed)?;
        let file = overlay
            .finish()?
            .into_inner()
            .map_err(|e| e.into_error())?;
        file.sync_data()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.overlay = None;
        Ok(())
    }
}
