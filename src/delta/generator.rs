use super::checksum::read_full;
use super::{BlockLibrary, Operation, RollingHash, MAX_DATA_OP};
use crate::error::Result;
use std::collections::VecDeque;
use std::io::Read;

/// Lazy block differ over a byte stream.
///
/// Yields [`Operation`]s as the input is consumed. Adjacent matches of
/// consecutive blocks in the same old file are merged into one BlockRange;
/// literal runs are flushed at [`MAX_DATA_OP`] bytes. The iterator ends
/// after the input is exhausted and cannot be restarted. An empty input
/// yields no operations.
pub struct BlockDiffer<'a, R> {
    reader: R,
    library: &'a BlockLibrary,
    preferred: Option<usize>,
    block_size: usize,
    read_chunk: usize,

    buf: Vec<u8>,
    /// Window start
    tail: usize,
    /// Start of the pending literal run
    data_tail: usize,
    eof: bool,
    done: bool,

    hash: Option<RollingHash>,
    rolling: bool,
    /// Length of the run of identical bytes ending at the window end
    constant_run: usize,
    last_lookup_missed: bool,

    pending_range: Option<(usize, u64, u64)>,
    ready: VecDeque<Operation>,
}

impl<'a, R: Read> BlockDiffer<'a, R> {
    /// `preferred` is the old file index matches should favor, usually the
    /// old version of the same path.
    pub fn new(reader: R, library: &'a BlockLibrary, preferred: Option<usize>) -> Self {
        let block_size = library.block_size();
        Self {
            reader,
            library,
            preferred,
            block_size,
            read_chunk: (block_size * 4).max(64 * 1024),
            buf: Vec::new(),
            tail: 0,
            data_tail: 0,
            eof: false,
            done: false,
            hash: None,
            rolling: false,
            constant_run: 0,
            last_lookup_missed: false,
            pending_range: None,
            ready: VecDeque::new(),
        }
    }

    fn fill(&mut self) -> Result<()> {
        while !self.eof && self.buf.len() - self.tail < self.block_size {
            self.compact();
            let start = self.buf.len();
            self.buf.resize(start + self.read_chunk, 0);
            let n = read_full(&mut self.reader, &mut self.buf[start..])?;
            self.buf.truncate(start + n);
            if n < self.read_chunk {
                self.eof = true;
            }
        }
        Ok(())
    }

    /// Drop bytes that are neither pending literal data nor needed to roll.
    fn compact(&mut self) {
        let keep_from = self.data_tail.min(self.tail.saturating_sub(1));
        if keep_from >= self.read_chunk {
            self.buf.drain(..keep_from);
            self.tail -= keep_from;
            self.data_tail -= keep_from;
        }
    }

    fn step(&mut self) -> Result<()> {
        self.fill()?;
        let bs = self.block_size;
        let avail = self.buf.len() - self.tail;

        if avail == 0 {
            self.finish();
            return Ok(());
        }

        if avail < bs {
            // Only the final partial block of an old file can match here
            let window = &self.buf[self.tail..];
            let weak = RollingHash::hash(window);
            let mut strong = None;
            let hit = self
                .library
                .find(weak, window, avail as u32, self.preferred, &mut strong)
                .map(|h| (h.file_index, h.block_index));
            if let Some((file_index, block_index)) = hit {
                self.flush_data(self.tail);
                self.push_range(file_index, block_index);
                self.tail = self.buf.len();
                self.data_tail = self.tail;
            }
            self.finish();
            return Ok(());
        }

        let weak = self.window_hash();

        // A constant window that already missed will miss again
        let skip = self.last_lookup_missed && self.constant_run > bs;
        let hit = if skip {
            None
        } else {
            let window = &self.buf[self.tail..self.tail + bs];
            let mut strong = None;
            self.library
                .find(weak, window, 0, self.preferred, &mut strong)
                .map(|h| (h.file_index, h.block_index))
        };

        match hit {
            Some((file_index, block_index)) => {
                self.flush_data(self.tail);
                self.push_range(file_index, block_index);
                self.tail += bs;
                self.data_tail = self.tail;
                self.rolling = false;
                self.last_lookup_missed = false;
            }
            None => {
                self.last_lookup_missed = true;
                self.tail += 1;
                self.rolling = true;
                if self.tail - self.data_tail >= MAX_DATA_OP {
                    self.flush_data(self.tail);
                }
            }
        }
        Ok(())
    }

    /// Weak hash of the full window at `tail`, rolled when possible
    fn window_hash(&mut self) -> u32 {
        let bs = self.block_size;
        let end = self.tail + bs;

        if self.rolling {
            if let Some(hash) = self.hash.as_mut() {
                let entering = self.buf[end - 1];
                hash.roll(self.buf[self.tail - 1], entering);
                if entering == self.buf[end - 2] {
                    self.constant_run += 1;
                } else {
                    self.constant_run = 1;
                }
                return hash.digest();
            }
        }

        let window = &self.buf[self.tail..end];
        let last = window[bs - 1];
        self.constant_run = window.iter().rev().take_while(|&&b| b == last).count();
        let hash = RollingHash::new(window);
        let digest = hash.digest();
        self.hash = Some(hash);
        digest
    }

    fn push_range(&mut self, file_index: usize, block_index: u64) {
        if let Some((f, b, span)) = self.pending_range.as_mut() {
            if *f == file_index && *b + *span == block_index {
                *span += 1;
                return;
            }
        }
        self.flush_range();
        self.pending_range = Some((file_index, block_index, 1));
    }

    fn flush_range(&mut self) {
        if let Some((file_index, block_index, block_span)) = self.pending_range.take() {
            self.ready.push_back(Operation::BlockRange {
                file_index,
                block_index,
                block_span,
            });
        }
    }

    fn flush_data(&mut self, end: usize) {
        if end > self.data_tail {
            self.flush_range();
            self.ready
                .push_back(Operation::Data(self.buf[self.data_tail..end].to_vec()));
        }
        self.data_tail = end;
    }

    fn finish(&mut self) {
        self.flush_data(self.buf.len());
        self.flush_range();
        self.done = true;
    }
}

impl<R: Read> Iterator for BlockDiffer<'_, R> {
    type Item = Result<Operation>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(op) = self.ready.pop_front() {
                return Some(Ok(op));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.step() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}
