//! Sparse overlay patches: the new bytes of a file expressed as runs to
//! keep from the existing file and runs to overwrite.

use crate::delta::checksum::read_full;
use crate::error::{PatchError, Result};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;

pub(crate) const OVERLAY_BUF_SIZE: usize = 128 * 1024;

/// Identical runs must be longer than this to become a skip
const SAME_THRESHOLD: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum OverlayOp {
    /// Keep this many bytes of the existing file
    Skip(u64),
    /// Overwrite with this many bytes, which follow the op
    Fresh(u64),
    Eof,
}

#[derive(Debug, PartialEq, Eq)]
enum Run {
    Skip(usize),
    Fresh(Range<usize>),
}

/// Split `new` into skip and fresh runs by comparing it with `old`.
fn plan_runs(old: &[u8], new: &[u8]) -> Vec<Run> {
    let compared = old.len().min(new.len());
    let mut runs = Vec::new();
    let mut last = 0;
    let mut same = 0;

    fn commit(end: usize, same: usize, last: &mut usize, runs: &mut Vec<Run>) {
        if end - same > *last {
            runs.push(Run::Fresh(*last..end - same));
        }
        runs.push(Run::Skip(same));
        *last = end;
    }

    for i in 0..compared {
        if old[i] == new[i] {
            same += 1;
        } else {
            if same > SAME_THRESHOLD {
                commit(i, same, &mut last, &mut runs);
            }
            same = 0;
        }
    }
    if same > SAME_THRESHOLD {
        commit(compared, same, &mut last, &mut runs);
    }
    if last < new.len() {
        runs.push(Run::Fresh(last..new.len()));
    }
    runs
}

/// Encodes writes as an overlay patch against `original`.
pub(crate) struct OverlayWriter<R, W> {
    original: R,
    read_offset: u64,
    out: W,
    write_offset: u64,
    pending: Vec<u8>,
    original_buf: Vec<u8>,
}

impl<R: Read, W: Write> OverlayWriter<R, W> {
    /// `original` must already be positioned at `read_offset`, `out` at `write_offset`
    pub(crate) fn new(original: R, read_offset: u64, out: W, write_offset: u64) -> Self {
        Self {
            original,
            read_offset,
            out,
            write_offset,
            pending: Vec::with_capacity(OVERLAY_BUF_SIZE),
            original_buf: vec![0u8; OVERLAY_BUF_SIZE],
        }
    }

    pub(crate) fn read_offset(&self) -> u64 {
        self.read_offset
    }

    pub(crate) fn write_offset(&self) -> u64 {
        self.write_offset
    }

    pub(crate) fn get_ref(&self) -> &W {
        &self.out
    }

    /// Encode buffered bytes and write the end marker
    pub(crate) fn finish(mut self) -> io::Result<W> {
        self.flush()?;
        self.emit(&OverlayOp::Eof, &[])?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn drain_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let result = self.process(&pending);
        self.pending = pending;
        self.pending.clear();
        result
    }

    fn process(&mut self, new: &[u8]) -> io::Result<()> {
        let read = read_full(&mut self.original, &mut self.original_buf[..new.len()])?;
        let runs = plan_runs(&self.original_buf[..read], new);
        for run in runs {
            match run {
                Run::Skip(len) => self.emit(&OverlayOp::Skip(len as u64), &[])?,
                Run::Fresh(range) => {
                    let data = &new[range];
                    self.emit(&OverlayOp::Fresh(data.len() as u64), data)?;
                }
            }
        }
        Ok(())
    }

    fn emit(&mut self, op: &OverlayOp, data: &[u8]) -> io::Result<()> {
        let encoded = bincode::serialize(op).map_err(io::Error::other)?;
        self.out.write_all(&encoded)?;
        self.out.write_all(data)?;
        self.write_offset += (encoded.len() + data.len()) as u64;
        match op {
            OverlayOp::Skip(len) | OverlayOp::Fresh(len) => self.read_offset += len,
            OverlayOp::Eof => {}
        }
        Ok(())
    }
}

impl<R: Read, W: Write> Write for OverlayWriter<R, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = OVERLAY_BUF_SIZE - self.pending.len();
        let n = room.min(buf.len());
        self.pending.extend_from_slice(&buf[..n]);
        if self.pending.len() == OVERLAY_BUF_SIZE {
            self.drain_pending()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain_pending()?;
        self.out.flush()
    }
}

/// Replay an overlay patch onto `out`, which holds the existing file.
///
/// Returns the final length; the caller truncates to it. Applying the same
/// patch twice gives the same result.
pub(crate) fn apply_overlay<R: Read, W: Write + Seek>(patch: &mut R, out: &mut W) -> Result<u64> {
    out.seek(SeekFrom::Start(0))?;
    loop {
        let op: OverlayOp = bincode::deserialize_from(&mut *patch)
            .map_err(|e| PatchError::Corrupt(format!("overlay patch: {}", e)))?;
        match op {
            OverlayOp::Skip(len) => {
                out.seek(SeekFrom::Current(len as i64))?;
            }
            OverlayOp::Fresh(len) => {
                let copied = io::copy(&mut (&mut *patch).take(len), out)?;
                if copied != len {
                    return Err(PatchError::Corrupt(format!(
                        "overlay patch ends inside a {}-byte fresh run",
                        len
                    )));
                }
            }
            OverlayOp::Eof => break,
        }
    }
    Ok(out.stream_position()?)
}
