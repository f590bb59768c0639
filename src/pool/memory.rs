use super::{Pool, ReadSeek, WritablePool};
use crate::error::{PatchError, Result};
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};

/// In-memory pool. Writers replace a file's bytes when flushed.
#[derive(Default)]
pub struct MemPool {
    files: Vec<Arc<Mutex<Vec<u8>>>>,
    current: Option<(usize, Cursor<Vec<u8>>)>,
}

impl MemPool {
    pub fn new(files: Vec<Vec<u8>>) -> Self {
        Self {
            files: files.into_iter().map(|f| Arc::new(Mutex::new(f))).collect(),
            current: None,
        }
    }

    /// Pool of `count` empty files, to be filled through writers
    pub fn with_len(count: usize) -> Self {
        Self::new(vec![Vec::new(); count])
    }

    /// Snapshot of a file's current bytes
    pub fn contents(&self, index: usize) -> Result<Vec<u8>> {
        let slot = self.slot(index)?;
        let data = slot
            .lock()
            .map_err(|_| PatchError::InvalidInput("memory pool lock poisoned".into()))?;
        Ok(data.clone())
    }

    fn slot(&self, index: usize) -> Result<&Arc<Mutex<Vec<u8>>>> {
        self.files.get(index).ok_or_else(|| {
            PatchError::Corrupt(format!(
                "file index {} out of range ({} files)",
                index,
                self.files.len()
            ))
        })
    }
}

impl Pool for MemPool {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn get_size(&self, index: usize) -> Result<u64> {
        let data = self
            .slot(index)?
            .lock()
            .map_err(|_| PatchError::InvalidInput("memory pool lock poisoned".into()))?;
        Ok(data.len() as u64)
    }

    fn get_reader(&mut self, index: usize) -> Result<&mut dyn ReadSeek> {
        if !matches!(&self.current, Some((current, _)) if *current == index) {
            let data = self.contents(index)?;
            self.current = Some((index, Cursor::new(data)));
        }
        match self.current.as_mut() {
            Some((_, cursor)) => {
                cursor.set_position(0);
                Ok(cursor)
            }
            None => Err(PatchError::InvalidInput("pool reader unavailable".into())),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }
}

impl WritablePool for MemPool {
    fn get_writer(&mut self, index: usize) -> Result<Box<dyn Write + Send>> {
        if matches!(&self.current, Some((current, _)) if *current == index) {
            self.current = None;
        }
        let slot = Arc::clone(self.slot(index)?);
        Ok(Box::new(MemWriter {
            slot,
            buf: Vec::new(),
        }))
    }
}

struct MemWriter {
    slot: Arc<Mutex<Vec<u8>>>,
    buf: Vec<u8>,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut data = self
            .slot
            .lock()
            .map_err(|_| std::io::Error::other("memory pool lock poisoned"))?;
        data.clone_from(&self.buf);
        Ok(())
    }
}
