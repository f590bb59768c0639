use super::{MessageCheckpoint, MessageRead, MessageWrite, PatchHeader};
use crate::compress::{self, Compression, CompressionSettings};
use crate::error::{PatchError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Raw message bytes gathered before a frame is compressed and written
pub const FRAME_TARGET_SIZE: usize = 256 * 1024;

const FRAME_HEADER_LEN: u64 = 8;
const MAX_FRAME_LEN: u32 = 1 << 30;

/// Writes the magic and header, then frames of length-prefixed messages.
pub struct WireWriter<W: Write> {
    inner: W,
    settings: CompressionSettings,
    frame: Vec<u8>,
    messages: u64,
}

impl<W: Write> WireWriter<W> {
    pub fn new(mut inner: W, magic: u32, header: &PatchHeader) -> Result<Self> {
        inner.write_all(&magic.to_le_bytes())?;
        let payload = bincode::serialize(header)?;
        write_varint(&mut inner, payload.len() as u64)?;
        inner.write_all(&payload)?;
        Ok(Self {
            inner,
            settings: header.compression,
            frame: Vec::with_capacity(FRAME_TARGET_SIZE),
            messages: 0,
        })
    }

    pub fn messages_written(&self) -> u64 {
        self.messages
    }

    fn flush_frame(&mut self) -> Result<()> {
        if self.frame.is_empty() {
            return Ok(());
        }
        let stored = compress::compress(&self.frame, self.settings)?;
        self.inner.write_all(&frame_len(self.frame.len())?.to_le_bytes())?;
        self.inner.write_all(&frame_len(stored.len())?.to_le_bytes())?;
        self.inner.write_all(&stored)?;
        self.frame.clear();
        Ok(())
    }

    /// Flush the last frame and hand back the inner writer
    pub fn finish(mut self) -> Result<W> {
        self.flush_frame()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> MessageWrite for WireWriter<W> {
    fn write_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let size = bincode::serialized_size(message)?;
        // Whole messages per frame; an oversized one gets a frame of its own
        if !self.frame.is_empty() && self.frame.len() as u64 + size > FRAME_TARGET_SIZE as u64 {
            self.flush_frame()?;
        }
        write_varint(&mut self.frame, size)?;
        bincode::serialize_into(&mut self.frame, message)?;
        self.messages += 1;
        if self.frame.len() >= FRAME_TARGET_SIZE {
            self.flush_frame()?;
        }
        Ok(())
    }
}

fn frame_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .ok()
        .filter(|&l| l <= MAX_FRAME_LEN)
        .ok_or_else(|| PatchError::InvalidInput(format!("frame of {} bytes is too large", len)))
}

/// Reads what [`WireWriter`] wrote. Needs `Seek` to honour checkpoints.
pub struct WireReader<R> {
    inner: R,
    compression: Compression,
    /// Offset of `inner`, tracked to avoid redundant seeks
    position: u64,
    first_frame: u64,
    frame: Vec<u8>,
    frame_pos: usize,
    frame_start: u64,
    next_frame: u64,
    messages_read: u64,
    want_save: bool,
}

impl<R: Read + Seek> WireReader<R> {
    /// Check the magic and read the header; `kind` names the file type in errors
    pub fn open(mut inner: R, magic: u32, kind: &'static str) -> Result<(Self, PatchHeader)> {
        let start = inner.stream_position()?;
        let mut buf = [0u8; 4];
        read_exact_or_truncated(&mut inner, &mut buf, start, "reading the magic number")?;
        let found = u32::from_le_bytes(buf);
        if found != magic {
            return Err(PatchError::BadMagic {
                kind,
                expected: magic,
                found,
            });
        }

        let len = read_raw_varint(&mut inner, start + 4)?;
        if len > MAX_FRAME_LEN as u64 {
            return Err(PatchError::Corrupt(format!("header claims {} bytes", len)));
        }
        let mut payload = vec![0u8; len as usize];
        read_exact_or_truncated(&mut inner, &mut payload, start + 4, "reading the header")?;
        let header: PatchHeader = bincode::deserialize(&payload)?;

        let first_frame = inner.stream_position()?;
        let reader = Self {
            inner,
            compression: header.compression.algorithm,
            position: first_frame,
            first_frame,
            frame: Vec::new(),
            frame_pos: 0,
            frame_start: first_frame,
            next_frame: first_frame,
            messages_read: 0,
            want_save: false,
        };
        Ok((reader, header))
    }

    pub fn messages_read(&self) -> u64 {
        self.messages_read
    }

    fn load_frame(&mut self, start: u64, context: &str) -> Result<()> {
        if self.position != start {
            self.inner.seek(SeekFrom::Start(start))?;
            self.position = start;
        }

        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        read_exact_or_truncated(&mut self.inner, &mut header, start, context)?;
        let raw_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let stored_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if raw_len == 0 || raw_len > MAX_FRAME_LEN || stored_len > MAX_FRAME_LEN {
            return Err(PatchError::Corrupt(format!(
                "frame at byte {} declares {} raw / {} stored bytes",
                start, raw_len, stored_len
            )));
        }

        let mut stored = vec![0u8; stored_len as usize];
        read_exact_or_truncated(&mut self.inner, &mut stored, start, context)?;
        self.position = start + FRAME_HEADER_LEN + stored_len as u64;

        self.frame = compress::decompress(&stored, self.compression, raw_len as usize)
            .map_err(|e| PatchError::Corrupt(format!("frame at byte {}: {}", start, e)))?;
        self.frame_start = start;
        self.next_frame = self.position;
        self.frame_pos = 0;
        Ok(())
    }

    fn checkpoint(&self) -> MessageCheckpoint {
        let (frame_offset, frame_position) = if self.frame_pos < self.frame.len() {
            (self.frame_start, self.frame_pos as u64)
        } else {
            (self.next_frame, 0)
        };
        MessageCheckpoint {
            frame_offset,
            frame_position,
            messages_read: self.messages_read,
        }
    }
}

impl<R: Read + Seek> MessageRead for WireReader<R> {
    fn read_message<T: DeserializeOwned>(&mut self) -> Result<T> {
        if self.frame_pos >= self.frame.len() {
            let context = format!("reading {}", short_type_name::<T>());
            self.load_frame(self.next_frame, &context)?;
        }

        let len = decode_varint(&self.frame, &mut self.frame_pos).ok_or_else(|| {
            PatchError::Corrupt(format!(
                "bad message length in frame at byte {}",
                self.frame_start
            ))
        })?;
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| self.frame_pos.checked_add(len))
            .filter(|&end| end <= self.frame.len())
            .ok_or_else(|| {
                PatchError::Corrupt(format!(
                    "message of {} bytes overruns frame at byte {}",
                    len, self.frame_start
                ))
            })?;

        let message = bincode::deserialize(&self.frame[self.frame_pos..end])?;
        self.frame_pos = end;
        self.messages_read += 1;
        Ok(message)
    }

    fn want_save(&mut self) {
        self.want_save = true;
    }

    fn pop_checkpoint(&mut self) -> Option<MessageCheckpoint> {
        if !self.want_save {
            return None;
        }
        self.want_save = false;
        Some(self.checkpoint())
    }

    fn resume(&mut self, checkpoint: Option<&MessageCheckpoint>) -> Result<()> {
        let Some(checkpoint) = checkpoint else {
            return Ok(());
        };
        if checkpoint.frame_offset < self.first_frame {
            return Err(PatchError::CheckpointMismatch(format!(
                "message offset {} lies inside the patch header",
                checkpoint.frame_offset
            )));
        }

        self.frame.clear();
        self.frame_pos = 0;
        self.next_frame = checkpoint.frame_offset;
        if checkpoint.frame_position > 0 {
            self.load_frame(checkpoint.frame_offset, "resuming from a checkpoint")?;
            if checkpoint.frame_position >= self.frame.len() as u64 {
                return Err(PatchError::CheckpointMismatch(format!(
                    "position {} is outside the {}-byte frame at byte {}",
                    checkpoint.frame_position,
                    self.frame.len(),
                    checkpoint.frame_offset
                )));
            }
            self.frame_pos = checkpoint.frame_position as usize;
        }
        self.messages_read = checkpoint.messages_read;
        Ok(())
    }
}

fn short_type_name<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    name.rsplit("::").next().unwrap_or(name)
}

fn read_exact_or_truncated<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    offset: u64,
    context: &str,
) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => PatchError::Truncated {
            offset,
            context: context.to_string(),
        },
        _ => PatchError::Io(e),
    })
}

fn write_varint<W: Write + ?Sized>(writer: &mut W, mut value: u64) -> io::Result<()> {
    let mut buf = [0u8; 10];
    let mut len = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[len] = byte;
            len += 1;
            break;
        }
        buf[len] = byte | 0x80;
        len += 1;
    }
    writer.write_all(&buf[..len])
}

fn decode_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

fn read_raw_varint<R: Read + ?Sized>(reader: &mut R, offset: u64) -> Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let mut byte = [0u8; 1];
        read_exact_or_truncated(reader, &mut byte, offset, "reading the header length")?;
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(PatchError::Corrupt("header length varint is too long".to_string()))
}
