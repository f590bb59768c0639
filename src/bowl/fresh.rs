use super::{
    copy_from_pool, writer_not_resumed, Bowl, BowlCheckpoint, EntryWriter, Transposition,
    WriterCheckpoint,
};
use crate::container::{set_mode, Container};
use crate::error::{PatchError, Result};
use crate::pool::{FsPool, Pool, WritablePool};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Writes the new tree into an empty output directory.
pub struct FreshBowl {
    output: FsPool,
}

impl FreshBowl {
    /// Prepares `output_dir` (directories and symlinks) right away
    pub fn new(source: Container, output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        source.prepare(&output_dir)?;
        Ok(Self {
            output: FsPool::new(source, output_dir),
        })
    }

    pub fn output_dir(&self) -> &Path {
        self.output.root()
    }
}

impl Bowl for FreshBowl {
    fn name(&self) -> &'static str {
        "fresh"
    }

    fn get_writer(&mut self, source_index: usize) -> Result<Box<dyn EntryWriter>> {
        let mode = self.output.container().file(source_index)?.mode;
        let path = self.output.get_path(source_index)?;
        Ok(Box::new(FileEntryWriter::new(path, mode)))
    }

    fn transpose(&mut self, transposition: Transposition, target_pool: &mut dyn Pool) -> Result<()> {
        let mut writer = self.output.get_writer(transposition.source_index)?;
        copy_from_pool(target_pool, transposition.target_index, &mut writer)?;
        Ok(())
    }

    fn save(&mut self) -> Result<BowlCheckpoint> {
        Ok(BowlCheckpoint::Fresh)
    }

    fn resume(&mut self, checkpoint: Option<&BowlCheckpoint>) -> Result<()> {
        match checkpoint {
            None | Some(BowlCheckpoint::Fresh) => Ok(()),
            Some(other) => Err(PatchError::CheckpointMismatch(format!(
                "{} checkpoint given to the fresh bowl",
                other.kind()
            ))),
        }
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Plain file writer; also used for new files staged by the overlay bowl.
pub(crate) struct FileEntryWriter {
    path: PathBuf,
    mode: u32,
    file: Option<BufWriter<File>>,
    offset: u64,
}

impl FileEntryWriter {
    pub(crate) fn new(path: PathBuf, mode: u32) -> Self {
        Self {
            path,
            mode,
            file: None,
            offset: 0,
        }
    }
}

impl Write for FileEntryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self.file.as_mut().ok_or_else(writer_not_resumed)?;
        let n = file.write(buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl EntryWriter for FileEntryWriter {
    fn resume(&mut self, checkpoint: Option<&WriterCheckpoint>) -> Result<u64> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;

        // Anything past the checkpoint was never acknowledged
        let offset = checkpoint.map_or(0, |c| c.offset);
        let existing = file.metadata()?.len();
        if existing < offset {
            return Err(PatchError::CheckpointMismatch(format!(
                "{} holds {} bytes, checkpoint expects {}",
                self.path.display(),
                existing,
                offset
            )));
        }
        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;
        if offset > 0 {
            tracing::debug!("Resuming {} at byte {}", self.path.display(), offset);
        }

        self.file = Some(BufWriter::new(file));
        self.offset = offset;
        Ok(offset)
    }

    fn save(&mut self) -> Result<WriterCheckpoint> {
        let file = self.file.as_mut().ok_or_else(writer_not_resumed)?;
        file.flush()?;
        file.get_ref().sync_data()?;
        Ok(WriterCheckpoint {
            offset: self.offset,
            overlay: None,
        })
    }

    fn tell(&self) -> u64 {
        self.offset
    }

    fn finalize(&mut self) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(writer_not_resumed)?;
        file.flush()?;
        file.get_ref().sync_data()?;
        set_mode(&self.path, self.mode)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}
