mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{ApplyArgs, Cli, Command, DiffArgs};
use colored::Colorize;
use shipwright::bowl::{Bowl, DiscardBowl, FreshBowl, OverlayBowl};
use shipwright::config::Config;
use shipwright::container::Container;
use shipwright::delta::{compute_signature, BLOCK_SIZE};
use shipwright::diff::DiffContext;
use shipwright::error::format_bytes;
use shipwright::patcher::{Checkpoint, Patcher, ResumeOutcome, TimedSaveConsumer};
use shipwright::pool::{FsPool, Pool};
use shipwright::progress::{CliProgress, ProgressSink};
use shipwright::resume::CheckpointFile;
use shipwright::signature::{read_signature, validate, write_signature};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level().as_str()));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = Config::load()?;

    match &cli.command {
        Command::Diff(args) => run_diff(args, &config, cli.quiet),
        Command::Apply(args) => run_apply(args, &config, cli.quiet),
        Command::Sign { dir, signature } => run_sign(dir, signature, &config, cli.quiet),
        Command::Verify { dir, signature } => run_verify(dir, signature, cli.quiet),
    }
}

fn create_output(path: &Path) -> Result<BufWriter<File>> {
    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn run_diff(args: &DiffArgs, config: &Config, quiet: bool) -> Result<()> {
    args.validate()?;
    let start = Instant::now();

    let mut options = config.diff_options()?;
    if let Some(algorithm) = args.compression {
        options.compression.algorithm = algorithm;
    }
    if let Some(quality) = args.quality {
        options.compression.quality = quality;
    }
    if let Some(partitions) = args.partitions {
        options.partitions = partitions;
    }
    if let Some(workers) = args.workers {
        options.workers = workers;
    }
    if let Some(limit) = args.suffix_limit {
        options.suffix_size_limit = limit;
    }
    options.suffix = !args.no_suffix;
    let compression = options.compression;

    let old = Container::walk(&args.old)?;
    let new = Container::walk(&args.new)?;
    if !quiet {
        println!("shipwright v{}", env!("CARGO_PKG_VERSION"));
        println!("Old: {}", old.stats());
        println!("New: {}", new.stats());
    }

    let progress = CliProgress::new(quiet);
    progress.progress_label("Hashing old tree");
    let mut old_pool = FsPool::new(old.clone(), &args.old);
    let signature = compute_signature(&old, &mut old_pool, BLOCK_SIZE)?;

    let mut ctx = DiffContext::new(old, signature, new.clone(), options);
    ctx.set_progress(Box::new(progress.clone()));
    let mut writer = ctx.write_patch(
        &mut FsPool::new(new.clone(), &args.new),
        Some(&mut old_pool as &mut dyn Pool),
        create_output(&args.patch)?,
    )?;
    writer.flush()?;

    if let Some(path) = &args.signature {
        let mut writer = write_signature(
            &new,
            &mut FsPool::new(new.clone(), &args.new),
            compression,
            create_output(path)?,
            &progress,
        )?;
        writer.flush()?;
    }
    progress.finish();

    if !quiet {
        let stats = ctx.stats();
        let patch_size = std::fs::metadata(&args.patch)?.len();
        println!("\n{}\n", "✓ Patch written".green().bold());
        println!("  Patch size:        {}", format_bytes(patch_size).cyan());
        println!("  Fresh bytes:       {}", format_bytes(stats.fresh_bytes).yellow());
        println!("  Reused bytes:      {}", format_bytes(stats.reused_bytes).green());
        println!("  Block-diff files:  {}", stats.block_files.to_string().blue());
        println!("  Suffix-diff files: {}", stats.suffix_files.to_string().blue());
        println!("  Unchanged files:   {}", stats.transpositions.to_string().bright_black());
        println!("  Compression:       {}", compression.to_string().cyan());
        println!("  Duration:          {}", format_duration(start.elapsed()).cyan());
    }
    Ok(())
}

fn run_apply(args: &ApplyArgs, config: &Config, quiet: bool) -> Result<()> {
    args.validate()?;
    let start = Instant::now();

    let patch_file = File::open(&args.patch)
        .with_context(|| format!("Failed to open {}", args.patch.display()))?;
    let mut patcher = Patcher::open(BufReader::new(patch_file))?;
    patcher.set_strict(!(args.best_effort || config.best_effort()));

    let target = patcher.target_container().clone();
    let source = patcher.source_container().clone();
    let output = args.out.clone().unwrap_or_else(|| args.old.clone());

    let mut bowl: Box<dyn Bowl> = if args.dry_run {
        Box::new(DiscardBowl::new())
    } else if args.in_place {
        let mut overlay =
            OverlayBowl::new(target.clone(), source.clone(), &args.old, args.stage_dir())?;
        if overlay.resume_pending_commit()? {
            // The old tree is partly replaced already, so it cannot be read again
            if !quiet {
                println!("{}", "Finishing an interrupted commit".yellow());
            }
            commit(&mut overlay, args)?;
            if !quiet {
                println!("\n{}\n", "✓ Patch applied".green().bold());
                println!("  Files:             {}", source.files.len().to_string().blue());
                println!("  Duration:          {}", format_duration(start.elapsed()).cyan());
            }
            return Ok(());
        }
        Box::new(overlay)
    } else {
        Box::new(FreshBowl::new(source.clone(), &output)?)
    };

    let mut resume_from = None;
    if let Some(checkpoint_path) = &args.checkpoint {
        if let Some(state) = CheckpointFile::load(checkpoint_path)? {
            if !state.is_compatible_with(&args.patch, &output) {
                anyhow::bail!(
                    "Checkpoint {} belongs to applying {} into {}",
                    checkpoint_path.display(),
                    state.patch.display(),
                    state.output.display()
                );
            }
            if !quiet {
                println!(
                    "Resuming from checkpoint taken at {} (file {} of {})",
                    state.checkpoint_at,
                    state.checkpoint.file_index + 1,
                    source.files.len()
                );
            }
            resume_from = Some(state);
        }

        let interval = Duration::from_secs(
            args.checkpoint_interval
                .unwrap_or_else(|| config.checkpoint_interval_secs()),
        );
        let path = checkpoint_path.clone();
        let patch = args.patch.clone();
        let out = output.clone();
        let mut record = resume_from.clone();
        let consumer = TimedSaveConsumer::new(interval, move |checkpoint: &Checkpoint| {
            let file = record.get_or_insert_with(|| {
                CheckpointFile::new(patch.clone(), out.clone(), checkpoint.clone())
            });
            file.update(checkpoint.clone());
            file.save(&path)
        });
        let consumer = match args.stop_after_checkpoints {
            Some(count) => consumer.stop_after(count),
            None => consumer,
        };
        patcher.set_save_consumer(Box::new(consumer));
    }

    let progress = CliProgress::new(quiet);
    patcher.set_progress(Box::new(progress.clone()));
    let mut target_pool = FsPool::new(target, &args.old);
    let outcome = patcher.resume(
        resume_from.as_ref().map(|state| &state.checkpoint),
        &mut target_pool,
        bowl.as_mut(),
    )?;
    progress.finish();

    if outcome == ResumeOutcome::Stopped {
        if !quiet {
            println!(
                "{}",
                "Stopped after a checkpoint; run the same command again to resume".yellow()
            );
        }
        return Ok(());
    }

    commit(bowl.as_mut(), args)?;

    if !quiet {
        let stats = patcher.stats();
        if args.dry_run {
            println!("\n{}\n", "✓ Dry-run complete (no changes made)".green().bold());
        } else {
            println!("\n{}\n", "✓ Patch applied".green().bold());
        }
        println!("  Files:             {}", source.files.len().to_string().blue());
        println!("  Rewritten:         {}", (stats.block_files + stats.suffix_files).to_string().yellow());
        println!("  Unchanged:         {}", stats.transpositions.to_string().bright_black());
        println!("  Bytes written:     {}", format_bytes(stats.bytes_written).cyan());
        println!("  Duration:          {}", format_duration(start.elapsed()).cyan());
    }
    Ok(())
}

/// Commit the bowl; the checkpoint is stale afterwards
fn commit(bowl: &mut dyn Bowl, args: &ApplyArgs) -> Result<()> {
    bowl.commit()?;
    if let Some(checkpoint_path) = &args.checkpoint {
        CheckpointFile::delete(checkpoint_path)?;
    }
    Ok(())
}

fn run_sign(dir: &Path, signature: &Path, config: &Config, quiet: bool) -> Result<()> {
    let container = Container::walk(dir)?;
    let progress = CliProgress::new(quiet);
    let mut writer = write_signature(
        &container,
        &mut FsPool::new(container.clone(), dir),
        config.compression_settings()?,
        create_output(signature)?,
        &progress,
    )?;
    writer.flush()?;
    progress.finish();

    if !quiet {
        println!("{} {}", "✓ Signed".green().bold(), container.stats());
    }
    Ok(())
}

fn run_verify(dir: &Path, signature: &Path, quiet: bool) -> Result<()> {
    let file = File::open(signature)
        .with_context(|| format!("Failed to open {}", signature.display()))?;
    let signature = read_signature(BufReader::new(file))?;
    let mut pool = FsPool::new(signature.container.clone(), dir);
    let wounds = validate(&signature, &mut pool)?;

    if wounds.is_empty() {
        if !quiet {
            println!("{} {}", "✓ Intact".green().bold(), signature.container.stats());
        }
        return Ok(());
    }

    let mut damaged = 0u64;
    for wound in &wounds {
        damaged += wound.len();
        let path = &signature.container.files[wound.file_index].path;
        eprintln!(
            "  {} {} bytes {}..{}",
            "✗".red(),
            path,
            wound.start,
            wound.end
        );
    }
    anyhow::bail!(
        "{} wounds found ({} damaged)",
        wounds.len(),
        format_bytes(damaged)
    )
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if secs >= 60 {
        let mins = secs / 60;
        let secs = secs % 60;
        if mins >= 60 {
            format!("{}h {}m {}s", mins / 60, mins % 60, secs)
        } else {
            format!("{}m {}s", mins, secs)
        }
    } else if secs > 0 {
        format!("{}.{:03}s", secs, millis)
    } else {
        format!("{}ms", millis)
    }
}
