//! Optional user configuration at `<config dir>/shipwright/config.toml`.
//!
//! Every key is optional; command-line flags override it.

use crate::compress::{Compression, CompressionSettings};
use crate::diff::DiffOptions;
use crate::error::{PatchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default seconds between checkpoints during `apply`
pub const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// "none", "lz4" or "zstd"
    pub compression: Option<String>,
    pub compression_quality: Option<i32>,
    pub partitions: Option<usize>,
    pub workers: Option<usize>,
    /// Size string such as "256MB"
    pub suffix_size_limit: Option<String>,
    pub checkpoint_interval_secs: Option<u64>,
    pub best_effort: Option<bool>,
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| PatchError::Config("could not determine the config directory".into()))?;
        Ok(dir.join("shipwright").join("config.toml"))
    }

    /// Load the user config; a missing file gives the defaults
    pub fn load() -> Result<Self> {
        match dirs::config_dir() {
            Some(dir) => Self::load_from(&dir.join("shipwright").join("config.toml")),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        tracing::debug!("Loading config from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text).map_err(|e| match e {
            PatchError::Config(msg) => PatchError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| PatchError::Config(e.to_string()))?;
        config.compression_settings()?;
        config.suffix_size_limit()?;
        Ok(config)
    }

    /// Compression from the config, falling back to the defaults
    pub fn compression_settings(&self) -> Result<CompressionSettings> {
        let mut settings = CompressionSettings::default();
        if let Some(name) = &self.compression {
            settings.algorithm = name.parse::<Compression>().map_err(PatchError::Config)?;
        }
        if let Some(quality) = self.compression_quality {
            settings.quality = quality;
        }
        Ok(settings)
    }

    pub fn suffix_size_limit(&self) -> Result<Option<u64>> {
        self.suffix_size_limit
            .as_deref()
            .map(|s| parse_size(s).map_err(PatchError::Config))
            .transpose()
    }

    /// Diff options with every configured key applied over the defaults
    pub fn diff_options(&self) -> Result<DiffOptions> {
        let mut options = DiffOptions {
            compression: self.compression_settings()?,
            ..DiffOptions::default()
        };
        if let Some(partitions) = self.partitions {
            options.partitions = partitions.max(1);
        }
        if let Some(workers) = self.workers {
            options.workers = workers.max(1);
        }
        if let Some(limit) = self.suffix_size_limit()? {
            options.suffix_size_limit = limit;
        }
        Ok(options)
    }

    pub fn checkpoint_interval_secs(&self) -> u64 {
        self.checkpoint_interval_secs
            .unwrap_or(DEFAULT_CHECKPOINT_INTERVAL_SECS)
    }

    pub fn best_effort(&self) -> bool {
        self.best_effort.unwrap_or(false)
    }
}

/// Parse sizes such as "512", "64KB", "1.5GB"
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim().to_uppercase();

    let (num_str, unit) = match s.find(|c: char| c.is_alphabetic()) {
        Some(pos) => (&s[..pos], &s[pos..]),
        None => return s.parse::<u64>().map_err(|e| format!("Invalid size: {}", e)),
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|e| format!("Invalid number '{}': {}", num_str, e))?;
    if num < 0.0 {
        return Err(format!("Size cannot be negative: {}", s));
    }

    let multiplier: u64 = match unit.trim() {
        "B" => 1,
        "KB" | "K" | "KIB" => 1024,
        "MB" | "M" | "MIB" => 1024 * 1024,
        "GB" | "G" | "GIB" => 1024 * 1024 * 1024,
        "TB" | "T" | "TIB" => 1024 * 1024 * 1024 * 1024,
        _ => return Err(format!("Unknown unit '{}'. Use B, KB, MB, GB, or TB", unit)),
    };

    Ok((num * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("64KB").unwrap(), 64 * 1024);
        assert_eq!(parse_size("256 MB").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_size("1.5g").unwrap(), 1536 * 1024 * 1024);
        assert!(parse_size("12XB").is_err());
        assert!(parse_size("-1MB").is_err());
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
compression = "lz4"
partitions = 4
workers = 2
suffix_size_limit = "64MB"
checkpoint_interval_secs = 30
best_effort = true
"#,
        )
        .unwrap();
        let options = config.diff_options().unwrap();
        assert_eq!(options.compression.algorithm, Compression::Lz4);
        assert_eq!(options.partitions, 4);
        assert_eq!(options.workers, 2);
        assert_eq!(options.suffix_size_limit, 64 * 1024 * 1024);
        assert_eq!(config.checkpoint_interval_secs(), 30);
        assert!(config.best_effort());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(
            config.compression_settings().unwrap(),
            CompressionSettings::default()
        );
        assert_eq!(
            config.checkpoint_interval_secs(),
            DEFAULT_CHECKPOINT_INTERVAL_SECS
        );
        assert!(!config.best_effort());
    }

    #[test]
    fn test_bad_values_are_config_errors() {
        assert!(matches!(
            Config::parse("compression = \"brotli\""),
            Err(PatchError::Config(_))
        ));
        assert!(matches!(
            Config::parse("suffix_size_limit = \"lots\""),
            Err(PatchError::Config(_))
        ));
        assert!(matches!(
            Config::parse("unknown_key = 1"),
            Err(PatchError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
    }
}
