use crate::bowl::{BowlCheckpoint, WriterCheckpoint};
use crate::container::Container;
use crate::error::Result;
use crate::protocol::MessageCheckpoint;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use xxhash_rust::xxh3::Xxh3;

/// Exact position inside a patch application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Identifies the patch this checkpoint belongs to
    pub fingerprint: u64,
    /// New file being processed
    pub file_index: usize,
    /// Next unread message
    pub message: MessageCheckpoint,
    /// `None` when saved between files
    pub file: Option<FileCheckpoint>,
    pub bowl: BowlCheckpoint,
}

/// Algorithm-specific state of a file in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileCheckpoint {
    BlockDiff {
        writer: WriterCheckpoint,
    },
    SuffixDiff {
        writer: WriterCheckpoint,
        target_index: usize,
        /// Cursor into the old file
        old_offset: u64,
    },
}

/// What to do after a checkpoint was handed over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSave {
    Continue,
    Stop,
}

/// Decides when to checkpoint and receives the checkpoints.
pub trait SaveConsumer {
    fn should_save(&mut self) -> bool;

    fn save(&mut self, checkpoint: Checkpoint) -> Result<AfterSave>;
}

/// Never checkpoints
pub struct NopSaveConsumer;

impl SaveConsumer for NopSaveConsumer {
    fn should_save(&mut self) -> bool {
        false
    }

    fn save(&mut self, _checkpoint: Checkpoint) -> Result<AfterSave> {
        Ok(AfterSave::Continue)
    }
}

/// Checkpoints once per interval and hands each one to `persist`.
pub struct TimedSaveConsumer<F> {
    interval: Duration,
    last: Instant,
    saves: u64,
    stop_after: Option<u64>,
    persist: F,
}

impl<F> TimedSaveConsumer<F>
where
    F: FnMut(&Checkpoint) -> Result<()>,
{
    pub fn new(interval: Duration, persist: F) -> Self {
        Self {
            interval,
            last: Instant::now(),
            saves: 0,
            stop_after: None,
            persist,
        }
    }

    /// Ask the patcher to stop once `count` checkpoints were saved
    pub fn stop_after(mut self, count: u64) -> Self {
        self.stop_after = Some(count);
        self
    }

    pub fn saves(&self) -> u64 {
        self.saves
    }
}

impl<F> SaveConsumer for TimedSaveConsumer<F>
where
    F: FnMut(&Checkpoint) -> Result<()>,
{
    fn should_save(&mut self) -> bool {
        self.last.elapsed() >= self.interval
    }

    fn save(&mut self, checkpoint: Checkpoint) -> Result<AfterSave> {
        (self.persist)(&checkpoint)?;
        self.saves += 1;
        self.last = Instant::now();
        tracing::debug!(
            "Checkpoint {} saved at file #{}",
            self.saves,
            checkpoint.file_index
        );
        match self.stop_after {
            Some(limit) if self.saves >= limit => Ok(AfterSave::Stop),
            _ => Ok(AfterSave::Continue),
        }
    }
}

/// Hash of both containers; a checkpoint only fits the patch it came from.
pub fn fingerprint(target: &Container, source: &Container) -> Result<u64> {
    let mut hasher = Xxh3::new();
    hasher.update(&bincode::serialize(target)?);
    hasher.update(&bincode::serialize(source)?);
    Ok(hasher.digest())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_checkpoint(file_index: usize) -> Checkpoint {
        Checkpoint {
            fingerprint: 42,
            file_index,
            message: MessageCheckpoint {
                frame_offset: 100,
                frame_position: 12,
                messages_read: 7,
            },
            file: Some(FileCheckpoint::SuffixDiff {
                writer: WriterCheckpoint {
                    offset: 64,
                    overlay: None,
                },
                target_index: 3,
                old_offset: 128,
            }),
            bowl: BowlCheckpoint::Fresh,
        }
    }

    #[test]
    fn test_timed_consumer_stops_after_limit() {
        let mut saved = Vec::new();
        let mut consumer = TimedSaveConsumer::new(Duration::ZERO, |c: &Checkpoint| {
            saved.push(c.file_index);
            Ok(())
        })
        .stop_after(2);

        assert!(consumer.should_save());
        assert_eq!(consumer.save(sample_checkpoint(0)).unwrap(), AfterSave::Continue);
        assert_eq!(consumer.save(sample_checkpoint(1)).unwrap(), AfterSave::Stop);
        assert_eq!(consumer.saves(), 2);
        drop(consumer);
        assert_eq!(saved, vec![0, 1]);
    }

    #[test]
    fn test_timed_consumer_waits_for_interval() {
        let mut consumer = TimedSaveConsumer::new(Duration::from_secs(3600), |_: &Checkpoint| Ok(()));
        assert!(!consumer.should_save());
    }

    #[test]
    fn test_checkpoint_survives_json() {
        let checkpoint = sample_checkpoint(5);
        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checkpoint);
    }

    #[test]
    fn test_fingerprint_tracks_containers() {
        let mut a = Container::new();
        a.push_file("a", 1);
        let mut b = Container::new();
        b.push_file("b", 1);
        assert_eq!(fingerprint(&a, &b).unwrap(), fingerprint(&a, &b).unwrap());
        assert_ne!(fingerprint(&a, &b).unwrap(), fingerprint(&b, &a).unwrap());
    }
}
