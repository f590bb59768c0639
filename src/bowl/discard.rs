use super::{Bowl, BowlCheckpoint, EntryWriter, Transposition, WriterCheckpoint};
use crate::error::{PatchError, Result};
use crate::pool::Pool;
use std::io::{self, Write};

/// Dry run: writers count bytes and drop them.
#[derive(Debug, Default)]
pub struct DiscardBowl {
    transpositions: u64,
}

impl DiscardBowl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transpositions(&self) -> u64 {
        self.transpositions
    }
}

impl Bowl for DiscardBowl {
    fn name(&self) -> &'static str {
        "discard"
    }

    fn get_writer(&mut self, _source_index: usize) -> Result<Box<dyn EntryWriter>> {
        Ok(Box::new(DiscardWriter { offset: 0 }))
    }

    fn transpose(&mut self, _transposition: Transposition, _target_pool: &mut dyn Pool) -> Result<()> {
        self.transpositions += 1;
        Ok(())
    }

    fn save(&mut self) -> Result<BowlCheckpoint> {
        Ok(BowlCheckpoint::Discard)
    }

    fn resume(&mut self, checkpoint: Option<&BowlCheckpoint>) -> Result<()> {
        match checkpoint {
            None | Some(BowlCheckpoint::Discard) => Ok(()),
            Some(other) => Err(PatchError::CheckpointMismatch(format!(
                "{} checkpoint given to the discard bowl",
                other.kind()
            ))),
        }
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

struct DiscardWriter {
    offset: u64,
}

impl Write for DiscardWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.offset += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl EntryWriter for DiscardWriter {
    fn resume(&mut self, checkpoint: Option<&WriterCheckpoint>) -> Result<u64> {
        self.offset = checkpoint.map_or(0, |c| c.offset);
        Ok(self.offset)
    }

    fn save(&mut self) -> Result<WriterCheckpoint> {
        Ok(WriterCheckpoint {
            offset: self.offset,
            overlay: None,
        })
    }

    fn tell(&self) -> u64 {
        self.offset
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
