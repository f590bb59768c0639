use super::{Pool, ReadSeek, WritablePool};
use crate::container::{set_mode, Container};
use crate::error::{PatchError, Result};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Pool backed by a directory laid out like its container.
pub struct FsPool {
    container: Container,
    root: PathBuf,
    current: Option<(usize, BufReader<File>)>,
}

impl FsPool {
    pub fn new(container: Container, root: impl Into<PathBuf>) -> Self {
        Self {
            container,
            root: root.into(),
            current: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// On-disk path of file `index`
    pub fn get_path(&self, index: usize) -> Result<PathBuf> {
        let file = self.container.file(index)?;
        self.container.entry_path(&self.root, &file.path)
    }
}

impl Pool for FsPool {
    fn len(&self) -> usize {
        self.container.files.len()
    }

    fn get_size(&self, index: usize) -> Result<u64> {
        Ok(self.container.file(index)?.size)
    }

    fn get_reader(&mut self, index: usize) -> Result<&mut dyn ReadSeek> {
        let reuse = matches!(self.current, Some((current, _)) if current == index);
        if !reuse {
            let path = self.get_path(index)?;
            tracing::trace!("Opening pool file {}", path.display());
            let file = File::open(&path).map_err(|e| {
                PatchError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to open {}: {}", path.display(), e),
                ))
            })?;
            self.current = Some((index, BufReader::new(file)));
        }

        match self.current.as_mut() {
            Some((_, reader)) => {
                reader.seek(SeekFrom::Start(0))?;
                Ok(reader)
            }
            None => Err(PatchError::InvalidInput("pool reader unavailable".into())),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }
}

impl WritablePool for FsPool {
    fn get_writer(&mut self, index: usize) -> Result<Box<dyn Write + Send>> {
        if matches!(self.current, Some((current, _)) if current == index) {
            self.current = None;
        }
        let mode = self.container.file(index)?.mode;
        let path = self.get_path(index)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        set_mode(&path, mode)?;
        Ok(Box::new(BufWriter::new(file)))
    }
}
