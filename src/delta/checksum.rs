use super::RollingHash;
use crate::container::Container;
use crate::error::Result;
use crate::pool::Pool;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;

/// Strong block digest (BLAKE3)
pub type StrongHash = [u8; 32];

/// Signature of one block of an old file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHash {
    pub file_index: usize,
    pub block_index: u64,
    /// Rolling checksum of the block
    pub weak: u32,
    /// BLAKE3 digest of the block
    pub strong: StrongHash,
    /// Length of the block if it is a final partial block, 0 for full blocks
    pub short_size: u32,
}

pub fn strong_hash(data: &[u8]) -> StrongHash {
    *blake3::hash(data).as_bytes()
}

/// Compute block hashes for one file.
///
/// An empty file yields a single zero-length short block so every file
/// has at least one entry and block indices stay contiguous from 0.
pub fn compute_file_signature<R: Read + ?Sized>(
    reader: &mut R,
    file_index: usize,
    block_size: usize,
) -> Result<Vec<BlockHash>> {
    let mut hashes = Vec::new();
    let mut buffer = vec![0u8; block_size];
    let mut block_index = 0u64;

    loop {
        let bytes_read = read_full(reader, &mut buffer)?;
        if bytes_read == 0 && block_index > 0 {
            break;
        }

        let block = &buffer[..bytes_read];
        hashes.push(BlockHash {
            file_index,
            block_index,
            weak: RollingHash::hash(block),
            strong: strong_hash(block),
            short_size: if bytes_read < block_size {
                bytes_read as u32
            } else {
                0
            },
        });
        block_index += 1;

        if bytes_read < block_size {
            break;
        }
    }

    Ok(hashes)
}

/// Compute block hashes for every file of a container, in container order
pub fn compute_signature(
    container: &Container,
    pool: &mut dyn Pool,
    block_size: usize,
) -> Result<Vec<BlockHash>> {
    let mut hashes = Vec::new();
    for index in 0..container.files.len() {
        let reader = pool.get_reader(index)?;
        hashes.extend(compute_file_signature(reader, index, block_size)?);
    }
    pool.close()?;
    Ok(hashes)
}

/// Fill `buf` as far as the reader allows; returns bytes read (short only at EOF)
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Weak hash index over a set of block hashes
#[derive(Debug, Default)]
pub struct BlockLibrary {
    by_weak: HashMap<u32, Vec<BlockHash>>,
    block_size: usize,
}

impl BlockLibrary {
    pub fn new(hashes: impl IntoIterator<Item = BlockHash>, block_size: usize) -> Self {
        let mut by_weak: HashMap<u32, Vec<BlockHash>> = HashMap::new();
        for hash in hashes {
            by_weak.entry(hash.weak).or_default().push(hash);
        }
        Self { by_weak, block_size }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn candidates(&self, weak: u32) -> Option<&[BlockHash]> {
        self.by_weak.get(&weak).map(|v| v.as_slice())
    }

    /// Find a block whose strong hash and short size match `data`.
    ///
    /// `strong` is computed at most once, and only if some candidate shares
    /// the short size. Candidates from `preferred` win over other files;
    /// otherwise the first match in signature order is used.
    pub fn find(
        &self,
        weak: u32,
        data: &[u8],
        short_size: u32,
        preferred: Option<usize>,
        strong: &mut Option<StrongHash>,
    ) -> Option<&BlockHash> {
        if data.is_empty() {
            return None;
        }
        let candidates = self.candidates(weak)?;

        let mut first_match: Option<&BlockHash> = None;
        for candidate in candidates {
            if candidate.short_size != short_size {
                continue;
            }
            let digest = strong.get_or_insert_with(|| strong_hash(data));
            if candidate.strong != *digest {
                continue;
            }
            if preferred == Some(candidate.file_index) {
                return Some(candidate);
            }
            if first_match.is_none() {
                first_match = Some(candidate);
                if preferred.is_none() {
                    break;
                }
            }
        }
        first_match
    }
}
