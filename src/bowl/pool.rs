use super::{copy_from_pool, Bowl, BowlCheckpoint, EntryWriter, Transposition, WriterCheckpoint};
use crate::error::{PatchError, Result};
use crate::pool::{Pool, WritablePool};
use std::io::{self, Write};

/// Sends output through a caller-supplied writable pool.
///
/// Pools give no way to reopen a half-written file, so this bowl cannot
/// checkpoint.
pub struct PoolBowl<P: WritablePool> {
    output: P,
}

impl<P: WritablePool> PoolBowl<P> {
    pub fn new(output: P) -> Self {
        Self { output }
    }

    pub fn into_inner(self) -> P {
        self.output
    }
}

impl<P: WritablePool> Bowl for PoolBowl<P> {
    fn name(&self) -> &'static str {
        "pool"
    }

    fn get_writer(&mut self, source_index: usize) -> Result<Box<dyn EntryWriter>> {
        let inner = self.output.get_writer(source_index)?;
        Ok(Box::new(PoolEntryWriter {
            inner: Some(inner),
            offset: 0,
        }))
    }

    fn transpose(&mut self, transposition: Transposition, target_pool: &mut dyn Pool) -> Result<()> {
        let mut writer = self.output.get_writer(transposition.source_index)?;
        copy_from_pool(target_pool, transposition.target_index, &mut writer)?;
        Ok(())
    }

    fn save(&mut self) -> Result<BowlCheckpoint> {
        Err(PatchError::UnsupportedCheckpoint("pool"))
    }

    fn resume(&mut self, checkpoint: Option<&BowlCheckpoint>) -> Result<()> {
        match checkpoint {
            None => Ok(()),
            Some(_) => Err(PatchError::UnsupportedCheckpoint("pool")),
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.output.close()
    }
}

struct PoolEntryWriter {
    inner: Option<Box<dyn Write + Send>>,
    offset: u64,
}

impl Write for PoolEntryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| io::Error::other("pool writer already closed"))?;
        let n = inner.write(buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl EntryWriter for PoolEntryWriter {
    fn resume(&mut self, checkpoint: Option<&WriterCheckpoint>) -> Result<u64> {
        match checkpoint {
            None => Ok(0),
            Some(_) => Err(PatchError::UnsupportedCheckpoint("pool")),
        }
    }

    fn save(&mut self) -> Result<WriterCheckpoint> {
        Err(PatchError::UnsupportedCheckpoint("pool"))
    }

    fn tell(&self) -> u64 {
        self.offset
    }

    fn finalize(&mut self) -> Result<()> {
        self.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut inner) = self.inner.take() {
            inner.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemPool;

    #[test]
    fn test_pool_bowl_writes_and_transposes() {
        let mut bowl = PoolBowl::new(MemPool::with_len(2));
        let mut writer = bowl.get_writer(0).unwrap();
        writer.resume(None).unwrap();
        writer.write_all(b"fresh bytes").unwrap();
        writer.finalize().unwrap();
        writer.close().unwrap();
        assert_eq!(writer.tell(), 11);

        let mut old = MemPool::new(vec![b"old".to_vec()]);
        bowl.transpose(
            Transposition {
                source_index: 1,
                target_index: 0,
            },
            &mut old,
        )
        .unwrap();
        bowl.commit().unwrap();

        let output = bowl.into_inner();
        assert_eq!(output.contents(0).unwrap(), b"fresh bytes");
        assert_eq!(output.contents(1).unwrap(), b"old");
    }

    #[test]
    fn test_pool_bowl_refuses_checkpoints() {
        let mut bowl = PoolBowl::new(MemPool::with_len(1));
        assert!(matches!(
            bowl.save(),
            Err(PatchError::UnsupportedCheckpoint("pool"))
        ));
        assert!(bowl.resume(Some(&BowlCheckpoint::Fresh)).is_err());
        assert!(bowl.resume(None).is_ok());

        let mut writer = bowl.get_writer(0).unwrap();
        assert!(writer.save().is_err());
    }
}
