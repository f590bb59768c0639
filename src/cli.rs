use clap::{Args, Parser, Subcommand};
use shipwright::compress::Compression;
use shipwright::config::parse_size;
use std::path::{Path, PathBuf};

fn parse_compression(s: &str) -> Result<Compression, String> {
    s.parse()
}

#[derive(Parser, Debug)]
#[command(name = "shipwright")]
#[command(about = "Compute and apply binary patches between two versions of a file tree", long_about = None)]
#[command(version)]
#[command(after_help = "EXAMPLES:
    # Create a patch from build v1 to build v2
    shipwright diff build-v1 build-v2 v1-to-v2.patch

    # Also write the signature of build v2, for later verification
    shipwright diff build-v1 build-v2 v1-to-v2.patch --signature v2.sig

    # Apply into a new directory
    shipwright apply v1-to-v2.patch build-v1 --out build-v2

    # Update build v1 in place, resumable after an interruption
    shipwright apply v1-to-v2.patch build-v1 --in-place --checkpoint apply.checkpoint

    # Check what applying a patch would write, without writing
    shipwright apply v1-to-v2.patch build-v1 --dry-run

    # Check a directory against a signature
    shipwright verify build-v2 v2.sig")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (only show errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a patch that turns OLD into NEW
    Diff(DiffArgs),
    /// Apply a patch to OLD
    Apply(ApplyArgs),
    /// Write the signature of a directory
    Sign {
        dir: PathBuf,
        signature: PathBuf,
    },
    /// Check a directory against a signature
    Verify {
        dir: PathBuf,
        signature: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Old directory
    pub old: PathBuf,

    /// New directory
    pub new: PathBuf,

    /// Patch file to write
    pub patch: PathBuf,

    /// Frame compression: none, lz4 or zstd
    #[arg(long, value_parser = parse_compression)]
    pub compression: Option<Compression>,

    /// Compression quality (zstd level)
    #[arg(long)]
    pub quality: Option<i32>,

    /// Suffix-array partitions (changes the patch)
    #[arg(long)]
    pub partitions: Option<usize>,

    /// Worker threads for suffix diffing (never changes the patch)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Only use block diffing
    #[arg(long)]
    pub no_suffix: bool,

    /// Largest file to suffix-diff (e.g. "256MB")
    #[arg(long, value_parser = parse_size)]
    pub suffix_limit: Option<u64>,

    /// Also write the signature of NEW to this file
    #[arg(long)]
    pub signature: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Patch file
    pub patch: PathBuf,

    /// Directory holding the old tree
    pub old: PathBuf,

    /// Write the new tree into this directory
    #[arg(long, conflicts_with_all = ["in_place", "dry_run"])]
    pub out: Option<PathBuf>,

    /// Update OLD in place
    #[arg(long, conflicts_with = "dry_run")]
    pub in_place: bool,

    /// Staging directory for --in-place (default: next to OLD)
    #[arg(long, requires = "in_place")]
    pub stage: Option<PathBuf>,

    /// Replay the patch without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Save progress to this file and resume from it if it exists
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Seconds between checkpoints
    #[arg(long)]
    pub checkpoint_interval: Option<u64>,

    /// Stop after this many checkpoints (for testing resumption)
    #[arg(long, requires = "checkpoint", hide = true)]
    pub stop_after_checkpoints: Option<u64>,

    /// Replace unreadable old blocks with zeros instead of failing
    #[arg(long)]
    pub best_effort: bool,
}

impl ApplyArgs {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.out.is_none() && !self.in_place && !self.dry_run {
            anyhow::bail!("One of --out, --in-place or --dry-run is required");
        }
        if !self.patch.is_file() {
            anyhow::bail!("Patch file does not exist: {}", self.patch.display());
        }
        if !self.old.is_dir() {
            anyhow::bail!("Old directory does not exist: {}", self.old.display());
        }
        if self.checkpoint.is_some() && self.dry_run {
            anyhow::bail!("--checkpoint cannot be used with --dry-run");
        }
        Ok(())
    }

    /// Staging directory for in-place application: `--stage`, or a hidden
    /// sibling of OLD
    pub fn stage_dir(&self) -> PathBuf {
        if let Some(stage) = &self.stage {
            return stage.clone();
        }
        let name = self
            .old
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tree".to_string());
        let parent = self.old.parent().unwrap_or(Path::new("."));
        parent.join(format!(".{}.shipwright-stage", name))
    }
}

impl DiffArgs {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (label, dir) in [("Old", &self.old), ("New", &self.new)] {
            if !dir.is_dir() {
                anyhow::bail!("{} directory does not exist: {}", label, dir.display());
            }
        }
        if self.partitions == Some(0) || self.workers == Some(0) {
            anyhow::bail!("--partitions and --workers must be at least 1");
        }
        Ok(())
    }
}

impl Cli {
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            return tracing::Level::ERROR;
        }

        match self.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}
