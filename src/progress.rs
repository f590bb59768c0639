//! Consumer-facing progress reporting.

use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use tracing::Level;

/// Narrow sink the engine reports progress through.
pub trait ProgressSink {
    /// Fraction of the current task done, in `0.0..=1.0`
    fn progress(&self, fraction: f64);

    /// Short description of the current task
    fn progress_label(&self, label: &str);

    fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!("{}", message),
            Level::WARN => tracing::warn!("{}", message),
            Level::INFO => tracing::info!("{}", message),
            Level::DEBUG => tracing::debug!("{}", message),
            Level::TRACE => tracing::trace!("{}", message),
        }
    }
}

/// Ignores progress
pub struct NopProgress;

impl ProgressSink for NopProgress {
    fn progress(&self, _fraction: f64) {}

    fn progress_label(&self, _label: &str) {}
}

/// Logs labels at debug level; for headless runs
#[derive(Debug, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn progress(&self, fraction: f64) {
        tracing::trace!("progress {:.1}%", fraction * 100.0);
    }

    fn progress_label(&self, label: &str) {
        tracing::debug!("{}", label);
    }
}

const BAR_LENGTH: u64 = 10_000;

/// Terminal progress bar; clones share one bar
#[derive(Clone)]
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(BAR_LENGTH);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for BarProgress {
    fn progress(&self, fraction: f64) {
        let position = (fraction.clamp(0.0, 1.0) * BAR_LENGTH as f64) as u64;
        self.bar.set_position(position);
    }

    fn progress_label(&self, label: &str) {
        self.bar.set_message(label.to_string());
    }

    fn log(&self, level: Level, message: &str) {
        if level <= Level::WARN {
            self.bar.suspend(|| eprintln!("{}", message));
        }
        tracing::debug!("{}", message);
    }
}

/// What the CLI reports through: a bar on a terminal, log lines otherwise.
#[derive(Clone)]
pub enum CliProgress {
    Bar(BarProgress),
    Log(TracingProgress),
}

impl CliProgress {
    pub fn new(quiet: bool) -> Self {
        if quiet || !std::io::stderr().is_terminal() {
            Self::Log(TracingProgress)
        } else {
            Self::Bar(BarProgress::new())
        }
    }

    pub fn finish(&self) {
        if let Self::Bar(bar) = self {
            bar.finish();
        }
    }
}

impl ProgressSink for CliProgress {
    fn progress(&self, fraction: f64) {
        match self {
            Self::Bar(bar) => bar.progress(fraction),
            Self::Log(log) => log.progress(fraction),
        }
    }

    fn progress_label(&self, label: &str) {
        match self {
            Self::Bar(bar) => bar.progress_label(label),
            Self::Log(log) => log.progress_label(label),
        }
    }

    fn log(&self, level: Level, message: &str) {
        match self {
            Self::Bar(bar) => bar.log(level, message),
            Self::Log(log) => log.log(level, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Recorder {
        labels: RefCell<Vec<String>>,
        last: RefCell<f64>,
    }

    impl ProgressSink for Recorder {
        fn progress(&self, fraction: f64) {
            *self.last.borrow_mut() = fraction;
        }
        fn progress_label(&self, label: &str) {
            self.labels.borrow_mut().push(label.to_string());
        }
    }

    #[test]
    fn test_sink_records() {
        let recorder = Recorder {
            labels: RefCell::new(Vec::new()),
            last: RefCell::new(0.0),
        };
        let sink: &dyn ProgressSink = &recorder;
        sink.progress_label("Sorting");
        sink.progress(0.5);
        sink.log(Level::INFO, "default log goes to tracing");
        assert_eq!(recorder.labels.borrow().as_slice(), ["Sorting".to_string()]);
        assert_eq!(*recorder.last.borrow(), 0.5);
    }

    #[test]
    fn test_quiet_cli_progress_logs() {
        let progress = CliProgress::new(true);
        assert!(matches!(progress, CliProgress::Log(_)));
        progress.progress_label("Scanning");
        progress.progress(2.0);
        progress.log(Level::WARN, "headless");
        progress.finish();
    }
}
