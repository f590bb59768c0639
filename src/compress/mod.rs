use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::str::FromStr;

/// Codec applied to patch frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    /// LZ4: fastest, lower ratio; good for patches applied on slow CPUs
    Lz4,
    /// Zstd: better ratio (default)
    Zstd,
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            _ => Err(format!("Unknown compression type: {}", s)),
        }
    }
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

/// Codec plus quality, as declared in a patch header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub algorithm: Compression,
    /// Zstd level; ignored by other codecs
    pub quality: i32,
}

pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            algorithm: Compression::Zstd,
            quality: DEFAULT_ZSTD_LEVEL,
        }
    }
}

impl CompressionSettings {
    pub fn none() -> Self {
        Self {
            algorithm: Compression::None,
            quality: 0,
        }
    }
}

impl std::fmt::Display for CompressionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.algorithm {
            Compression::Zstd => write!(f, "zstd-q{}", self.quality),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Compress data
pub fn compress(data: &[u8], settings: CompressionSettings) -> io::Result<Vec<u8>> {
    match settings.algorithm {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => compress_lz4(data),
        Compression::Zstd => compress_zstd(data, settings.quality),
    }
}

/// Decompress data; `raw_len` is the expected decompressed size
pub fn decompress(data: &[u8], compression: Compression, raw_len: usize) -> io::Result<Vec<u8>> {
    let out = match compression {
        Compression::None => data.to_vec(),
        Compression::Lz4 => decompress_lz4(data)?,
        Compression::Zstd => decompress_zstd(data, raw_len)?,
    };
    if out.len() != raw_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "decompressed {} bytes, frame declares {}",
                out.len(),
                raw_len
            ),
        ));
    }
    Ok(out)
}

fn compress_lz4(data: &[u8]) -> io::Result<Vec<u8>> {
    Ok(lz4_flex::compress_prepend_size(data))
}

fn decompress_lz4(data: &[u8]) -> io::Result<Vec<u8>> {
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn compress_zstd(data: &[u8], level: i32) -> io::Result<Vec<u8>> {
    let mut encoder = zstd::Encoder::new(Vec::new(), level)?;
    encoder.write_all(data)?;
    encoder.finish()
}

fn decompress_zstd(data: &[u8], raw_len: usize) -> io::Result<Vec<u8>> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut result = Vec::with_capacity(raw_len);
    decoder.read_to_end(&mut result)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(algorithm: Compression) -> CompressionSettings {
        CompressionSettings {
            algorithm,
            quality: DEFAULT_ZSTD_LEVEL,
        }
    }

    #[test]
    fn test_compress_decompress_lz4() {
        let data = b"Hello, World! ".repeat(100);
        let compressed = compress(&data, settings(Compression::Lz4)).unwrap();
        assert!(compressed.len() < data.len());
        let decompressed = decompress(&compressed, Compression::Lz4, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_decompress_zstd() {
        let data = b"patch frame payload ".repeat(200);
        let compressed = compress(&data, settings(Compression::Zstd)).unwrap();
        assert!(compressed.len() < data.len() / 5);
        let decompressed = decompress(&compressed, Compression::Zstd, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_decompress_none() {
        let data = b"uncompressed";
        let compressed = compress(data, CompressionSettings::none()).unwrap();
        assert_eq!(compressed, data);
        assert_eq!(decompress(&compressed, Compression::None, data.len()).unwrap(), data);
    }

    #[test]
    fn test_declared_length_is_checked() {
        let data = b"some bytes";
        let compressed = compress(data, settings(Compression::Zstd)).unwrap();
        assert!(decompress(&compressed, Compression::Zstd, data.len() + 1).is_err());
    }

    #[test]
    fn test_roundtrip_empty_data() {
        for algorithm in [Compression::None, Compression::Lz4, Compression::Zstd] {
            let compressed = compress(b"", settings(algorithm)).unwrap();
            assert!(decompress(&compressed, algorithm, 0).unwrap().is_empty());
        }
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("ZSTD".parse::<Compression>().unwrap(), Compression::Zstd);
        assert_eq!("lz4".parse::<Compression>().unwrap(), Compression::Lz4);
        assert!("brotli".parse::<Compression>().is_err());
        assert_eq!(CompressionSettings::default().to_string(), "zstd-q3");
        assert_eq!(CompressionSettings::none().to_string(), "none");
    }
}
