//! Random-access views over the files of a [`Container`](crate::container::Container).

mod fs;
mod memory;

pub use self::fs::FsPool;
pub use self::memory::MemPool;

use crate::error::Result;
use std::io::{Read, Seek, Write};

/// A seekable byte source.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Readable pool: file index to seekable reader.
///
/// A pool keeps at most one reader open; asking for another file index
/// invalidates the previous reader, which the borrow on `&mut self` enforces.
pub trait Pool {
    /// Number of files in the pool
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declared size of a file
    fn get_size(&self, index: usize) -> Result<u64>;

    /// Reader positioned at the start of the file
    fn get_reader(&mut self, index: usize) -> Result<&mut dyn ReadSeek>;

    /// Release any open handles. The pool stays usable afterwards.
    fn close(&mut self) -> Result<()>;
}

/// Pool that also accepts whole-file writes.
pub trait WritablePool: Pool {
    /// Writer that replaces the file's contents. Dropping it after a
    /// successful `flush` completes the file.
    fn get_writer(&mut self, index: usize) -> Result<Box<dyn Write + Send>>;
}

/// Read the whole file at `index` into memory.
pub fn read_all(pool: &mut dyn Pool, index: usize) -> Result<Vec<u8>> {
    let size = pool.get_size(index)?;
    let reader = pool.get_reader(index)?;
    let mut buf = Vec::with_capacity(size as usize);
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}
