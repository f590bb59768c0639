//! Signature files: the block hashes of a tree, and validation of a
//! directory against them.

use crate::compress::CompressionSettings;
use crate::container::Container;
use crate::delta::checksum::{read_full, strong_hash};
use crate::delta::{compute_file_signature, num_blocks, BlockHash, RollingHash, BLOCK_SIZE};
use crate::error::{format_bytes, Result};
use crate::pool::Pool;
use crate::progress::ProgressSink;
use crate::protocol::{
    BlockHashMessage, MessageRead, MessageWrite, PatchHeader, WireReader, WireWriter,
    SIGNATURE_MAGIC,
};
use std::fmt;
use std::io::{Read, Seek, Write};

/// A tree's container plus the hash of every block, in container order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub container: Container,
    pub hashes: Vec<BlockHash>,
}

/// Damaged byte range `start..end` of file `file_index`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wound {
    pub file_index: usize,
    pub start: u64,
    pub end: u64,
}

impl Wound {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for Wound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "file #{} bytes {}..{} ({})",
            self.file_index,
            self.start,
            self.end,
            format_bytes(self.len())
        )
    }
}

/// Hash every file of `container` and write the signature stream to `out`
pub fn write_signature<W: Write>(
    container: &Container,
    pool: &mut dyn Pool,
    compression: CompressionSettings,
    out: W,
    progress: &dyn ProgressSink,
) -> Result<W> {
    let mut wire = WireWriter::new(out, SIGNATURE_MAGIC, &PatchHeader { compression })?;
    wire.write_message(container)?;

    for (index, file) in container.files.iter().enumerate() {
        progress.progress_label(&file.path);
        if container.size > 0 {
            progress.progress(file.offset as f64 / container.size as f64);
        }
        let reader = pool.get_reader(index)?;
        for hash in compute_file_signature(reader, index, BLOCK_SIZE)? {
            wire.write_message(&BlockHashMessage {
                weak: hash.weak,
                strong: hash.strong,
            })?;
        }
    }
    pool.close()?;
    progress.progress(1.0);
    wire.finish()
}

/// Number of hashes stored for a file; empty files still get one
fn hashes_per_file(size: u64) -> u64 {
    num_blocks(size, BLOCK_SIZE).max(1)
}

fn block_len(size: u64, block_index: u64) -> u64 {
    let start = block_index * BLOCK_SIZE as u64;
    (size - start.min(size)).min(BLOCK_SIZE as u64)
}

pub fn read_signature<R: Read + Seek>(input: R) -> Result<Signature> {
    let (mut wire, _header) = WireReader::open(input, SIGNATURE_MAGIC, "signature")?;
    let container: Container = wire.read_message()?;

    let mut hashes = Vec::new();
    for (file_index, file) in container.files.iter().enumerate() {
        for block_index in 0..hashes_per_file(file.size) {
            let message: BlockHashMessage = wire.read_message()?;
            let len = block_len(file.size, block_index);
            hashes.push(BlockHash {
                file_index,
                block_index,
                weak: message.weak,
                strong: message.strong,
                short_size: if len < BLOCK_SIZE as u64 { len as u32 } else { 0 },
            });
        }
    }
    tracing::debug!(
        "Read signature of {} ({} blocks)",
        container.stats(),
        hashes.len()
    );
    Ok(Signature { container, hashes })
}

/// Compare the files behind `pool` with a signature.
///
/// Missing, unreadable, or mis-sized files are wounded whole. Adjacent
/// damaged blocks are reported as one wound.
pub fn validate(signature: &Signature, pool: &mut dyn Pool) -> Result<Vec<Wound>> {
    let mut wounds: Vec<Wound> = Vec::new();
    let mut add = |wound: Wound| match wounds.last_mut() {
        Some(last) if last.file_index == wound.file_index && last.end == wound.start => {
            last.end = wound.end;
        }
        _ => wounds.push(wound),
    };

    let mut hashes = signature.hashes.as_slice();
    let mut buffer = vec![0u8; BLOCK_SIZE];
    for (file_index, file) in signature.container.files.iter().enumerate() {
        let count = (hashes_per_file(file.size) as usize).min(hashes.len());
        let (expected, rest) = hashes.split_at(count);
        hashes = rest;
        let whole = Wound {
            file_index,
            start: 0,
            end: file.size,
        };

        let reader = match pool.get_reader(file_index) {
            Ok(reader) => reader,
            Err(e) => {
                tracing::debug!("{}: {}", file.path, e);
                add(whole);
                continue;
            }
        };

        let mut file_wounds = Vec::new();
        let mut intact = true;
        for hash in expected {
            let len = block_len(file.size, hash.block_index) as usize;
            let read = read_full(reader, &mut buffer[..len])?;
            if read != len {
                intact = false;
                break;
            }
            let block = &buffer[..len];
            if len > 0 && (RollingHash::hash(block) != hash.weak || strong_hash(block) != hash.strong) {
                tracing::debug!(
                    "{}: block {} expected {}, found {}",
                    file.path,
                    hash.block_index,
                    hex::encode(hash.strong),
                    hex::encode(strong_hash(block))
                );
                let start = hash.block_index * BLOCK_SIZE as u64;
                file_wounds.push(Wound {
                    file_index,
                    start,
                    end: start + len as u64,
                });
            }
        }
        if intact && read_full(reader, &mut buffer[..1])? != 0 {
            intact = false;
        }

        if intact {
            file_wounds.into_iter().for_each(&mut add);
        } else {
            tracing::debug!("{}: size differs from {}", file.path, file.size);
            add(whole);
        }
    }
    pool.close()?;
    Ok(wounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{FsPool, MemPool};
    use crate::progress::NopProgress;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn sample() -> (Container, Vec<Vec<u8>>) {
        let files = vec![
            (0..3 * BLOCK_SIZE + 100).map(|i| (i % 251) as u8).collect::<Vec<u8>>(),
            Vec::new(),
            b"tiny".to_vec(),
        ];
        let mut container = Container::new();
        for (name, data) in ["big", "empty", "tiny"].iter().zip(&files) {
            container.push_file(*name, data.len() as u64);
        }
        (container, files)
    }

    fn signature_of(container: &Container, files: &[Vec<u8>]) -> Signature {
        let bytes = write_signature(
            container,
            &mut MemPool::new(files.to_vec()),
            CompressionSettings::default(),
            Vec::new(),
            &NopProgress,
        )
        .unwrap();
        read_signature(Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn test_signature_roundtrip_matches_direct_hashes() {
        let (container, files) = sample();
        let signature = signature_of(&container, &files);
        assert_eq!(signature.container, container);

        let mut direct = Vec::new();
        for (i, data) in files.iter().enumerate() {
            direct.extend(compute_file_signature(&mut data.as_slice(), i, BLOCK_SIZE).unwrap());
        }
        assert_eq!(signature.hashes, direct);
    }

    #[test]
    fn test_intact_tree_has_no_wounds() {
        let (container, files) = sample();
        let signature = signature_of(&container, &files);
        let wounds = validate(&signature, &mut MemPool::new(files)).unwrap();
        assert!(wounds.is_empty());
    }

    #[test]
    fn test_adjacent_damaged_blocks_merge() {
        let (container, mut files) = sample();
        let signature = signature_of(&container, &files);
        files[0][10] ^= 1;
        files[0][BLOCK_SIZE + 10] ^= 1;
        files[0][3 * BLOCK_SIZE + 5] ^= 1;
        let wounds = validate(&signature, &mut MemPool::new(files)).unwrap();
        assert_eq!(
            wounds,
            vec![
                Wound {
                    file_index: 0,
                    start: 0,
                    end: 2 * BLOCK_SIZE as u64
                },
                Wound {
                    file_index: 0,
                    start: 3 * BLOCK_SIZE as u64,
                    end: 3 * BLOCK_SIZE as u64 + 100
                },
            ]
        );
    }

    #[test]
    fn test_missing_and_resized_files_wound_whole() {
        let (container, files) = sample();
        let signature = signature_of(&container, &files);

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big"), &files[0]).unwrap();
        std::fs::write(dir.path().join("tiny"), b"tiny!").unwrap();
        let mut pool = FsPool::new(container, dir.path());
        let wounds = validate(&signature, &mut pool).unwrap();
        assert_eq!(
            wounds,
            vec![
                Wound {
                    file_index: 1,
                    start: 0,
                    end: 0
                },
                Wound {
                    file_index: 2,
                    start: 0,
                    end: 4
                },
            ]
        );
    }

    #[test]
    fn test_wrong_magic() {
        let err = read_signature(Cursor::new(b"SWP1xxxx".to_vec())).unwrap_err();
        assert!(err.is_corruption());
    }
}
