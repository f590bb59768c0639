//! Overlay commit: everything that touches the output tree happens here.
//!
//! The rename plan (with its temporary names), the bowl state it was made
//! from and the index of the last finished step are journaled next to the
//! stage directory before the output tree is touched. A failed commit can be
//! run again, from a new process too, and picks up where it stopped.

use super::writer::apply_overlay;
use super::OverlayCheckpoint;
use crate::container::{ensure_symlink, set_mode, Container};
use crate::error::{PatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::xxh3_64;

const JOURNAL_SUFFIX: &str = ".commit.json";
const JOURNAL_VERSION: u32 = 1;
const SWAP_SUFFIX: &str = ".shipwright-swap-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) enum CommitStep {
    /// Duplicate an output file
    Copy { from: String, to: String },
    /// Rename inside the output tree
    Rename { from: String, to: String },
    /// Move a staged new file into place
    Place { source_index: usize },
    /// Apply a staged overlay patch to the existing file
    Overlay { source_index: usize },
}

#[derive(Debug, Serialize, Deserialize)]
struct Journal {
    version: u32,
    /// Hash of the bowl state the plan was made for
    state_hash: u64,
    state: OverlayCheckpoint,
    steps: Vec<CommitStep>,
    completed: usize,
}

impl Journal {
    /// `<stage>.commit.json`, beside the stage directory so no staged entry
    /// can collide with it
    fn path(stage_dir: &Path) -> PathBuf {
        let mut name = stage_dir
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("stage"));
        name.push(JOURNAL_SUFFIX);
        stage_dir.with_file_name(name)
    }

    fn load(stage_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(stage_dir);
        if !path.exists() {
            return Ok(None);
        }
        tracing::debug!("Loading commit journal from {}", path.display());
        let file = File::open(&path)?;
        let journal: Self = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            PatchError::Corrupt(format!("commit journal {}: {}", path.display(), e))
        })?;
        if journal.version != JOURNAL_VERSION {
            return Err(PatchError::CheckpointMismatch(format!(
                "commit journal version {} (expected {})",
                journal.version, JOURNAL_VERSION
            )));
        }
        Ok(Some(journal))
    }

    fn save(&self, stage_dir: &Path) -> Result<()> {
        let path = Self::path(stage_dir);
        let mut temp_name = path.as_os_str().to_os_string();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);
        let writer = BufWriter::new(File::create(&temp_path)?);
        serde_json::to_writer_pretty(writer, self)
            .map_err(|e| PatchError::Io(io::Error::other(format!("writing commit journal: {}", e))))?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn delete(stage_dir: &Path) -> Result<()> {
        match fs::remove_file(Self::path(stage_dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// State of a commit that stopped part way, if its journal is still there
pub(super) fn pending_state(stage_dir: &Path) -> Result<Option<OverlayCheckpoint>> {
    Ok(Journal::load(stage_dir)?.map(|journal| journal.state))
}

pub(super) struct Committer<'a> {
    pub(super) source: &'a Container,
    pub(super) target: &'a Container,
    pub(super) output_dir: &'a Path,
    pub(super) stage_dir: &'a Path,
    pub(super) state: &'a OverlayCheckpoint,
}

impl Committer<'_> {
    /// Run the commit; returns ghost directories that could not be removed
    pub(super) fn run(&self) -> Result<Vec<PathBuf>> {
        let state_hash = xxh3_64(&bincode::serialize(self.state)?);
        let mut journal = match Journal::load(self.stage_dir)? {
            Some(journal) if journal.state_hash == state_hash => {
                tracing::info!(
                    "Resuming commit at step {}/{}",
                    journal.completed,
                    journal.steps.len()
                );
                journal
            }
            Some(_) => {
                return Err(PatchError::CheckpointMismatch(
                    "the commit journal beside the stage directory belongs to another patch".into(),
                ))
            }
            None => {
                let journal = Journal {
                    version: JOURNAL_VERSION,
                    state_hash,
                    state: self.state.clone(),
                    steps: self.plan()?,
                    completed: 0,
                };
                journal.save(self.stage_dir)?;
                journal
            }
        };

        let needed = self.transposition_sources()?;
        self.ensure_dirs(&needed)?;
        self.ensure_symlinks(Some(&needed))?;

        while journal.completed < journal.steps.len() {
            let step = journal.steps[journal.completed].clone();
            self.execute(&step)?;
            journal.completed += 1;
            journal.save(self.stage_dir)?;
        }
        self.ensure_symlinks(None)?;

        let leftovers = self.delete_ghosts()?;

        if let Err(e) = fs::remove_dir_all(self.stage_dir) {
            tracing::warn!(
                "Could not remove stage directory {}: {}",
                self.stage_dir.display(),
                e
            );
        }
        Journal::delete(self.stage_dir)?;
        Ok(leftovers)
    }

    fn output_path(&self, rel: &str) -> Result<PathBuf> {
        self.source.entry_path(self.output_dir, rel)
    }

    fn source_path(&self, index: usize) -> Result<&str> {
        Ok(self.source.file(index)?.path.as_str())
    }

    /// Old paths that some transposition reads from
    fn transposition_sources(&self) -> Result<HashSet<&str>> {
        self.state
            .transpositions
            .iter()
            .map(|t| Ok(self.target.file(t.target_index)?.path.as_str()))
            .collect()
    }

    fn ensure_dirs(&self, needed: &HashSet<&str>) -> Result<()> {
        for dir in &self.source.dirs {
            let path = self.output_path(&dir.path)?;
            if let Ok(meta) = path.symlink_metadata() {
                if !meta.is_dir() {
                    if needed.contains(dir.path.as_str()) {
                        return Err(PatchError::Commit {
                            path,
                            source: io::Error::new(
                                io::ErrorKind::AlreadyExists,
                                "an old file that is still needed sits where a directory goes",
                            ),
                        });
                    }
                    tracing::debug!("Removing {} to make room for a directory", path.display());
                    fs::remove_file(&path).map_err(commit_error(&path))?;
                }
            }
            fs::create_dir_all(&path).map_err(commit_error(&path))?;
            set_mode(&path, dir.mode)?;
        }
        Ok(())
    }

    /// Create or correct symlinks. With `deferred`, links that would replace
    /// an old file still waiting to be renamed are left for a later pass.
    fn ensure_symlinks(&self, deferred: Option<&HashSet<&str>>) -> Result<()> {
        for link in &self.source.symlinks {
            let path = self.output_path(&link.path)?;
            let blocked = deferred.is_some_and(|needed| {
                needed.contains(link.path.as_str())
                    && path.symlink_metadata().is_ok_and(|m| m.is_file())
            });
            if blocked {
                tracing::debug!("Deferring symlink {}", link.path);
                continue;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(commit_error(parent))?;
            }
            ensure_symlink(&path, &link.dest)?;
        }
        Ok(())
    }

    fn plan(&self) -> Result<Vec<CommitStep>> {
        let mut steps = self.plan_transpositions()?;

        let mut moves = self.state.move_files.clone();
        moves.sort_unstable();
        steps.extend(moves.into_iter().map(|source_index| CommitStep::Place { source_index }));

        let mut overlays = self.state.overlay_files.clone();
        overlays.sort_unstable();
        steps.extend(
            overlays
                .into_iter()
                .map(|source_index| CommitStep::Overlay { source_index }),
        );

        tracing::debug!("Commit plan has {} steps", steps.len());
        Ok(steps)
    }

    fn plan_transpositions(&self) -> Result<Vec<CommitStep>> {
        // Old path -> new paths it becomes
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut transpositions = self.state.transpositions.clone();
        transpositions.sort_by_key(|t| t.source_index);
        for t in &transpositions {
            let old = self.target.file(t.target_index)?.path.clone();
            let new = self.source.file(t.source_index)?.path.clone();
            groups.entry(old).or_default().push(new);
        }

        // A destination that is itself renamed away goes through a temporary name
        let mut names = TempNames::new(self.output_dir, self.source, self.target);
        let mut swaps = Vec::new();
        let keys: HashSet<String> = groups.keys().cloned().collect();
        for (old, news) in groups.iter_mut() {
            for new in news.iter_mut() {
                if new != old && keys.contains(new.as_str()) {
                    let temp = names.allocate(new)?;
                    swaps.push(CommitStep::Rename {
                        from: temp.clone(),
                        to: new.clone(),
                    });
                    *new = temp;
                }
            }
        }

        let overlay_paths: HashSet<&str> = self
            .state
            .overlay_files
            .iter()
            .map(|&i| self.source_path(i))
            .collect::<Result<_>>()?;

        let mut steps = Vec::new();
        for (old, news) in &groups {
            let in_place = news.iter().any(|new| new == old);
            // A pending overlay patches the old file, so it must stay put
            let keep_original = overlay_paths.contains(old.as_str());

            let mut destinations = news.iter().filter(|new| *new != old);
            let primary = if in_place { None } else { destinations.next() };
            for new in destinations {
                steps.push(CommitStep::Copy {
                    from: old.clone(),
                    to: new.clone(),
                });
            }
            if let Some(new) = primary {
                let (from, to) = (old.clone(), new.clone());
                steps.push(if keep_original {
                    CommitStep::Copy { from, to }
                } else {
                    CommitStep::Rename { from, to }
                });
            }
        }
        steps.extend(swaps);
        Ok(steps)
    }

    fn execute(&self, step: &CommitStep) -> Result<()> {
        tracing::trace!("Commit step {:?}", step);
        match step {
            CommitStep::Copy { from, to } => {
                copy_file(&self.output_path(from)?, &self.output_path(to)?)
            }
            CommitStep::Rename { from, to } => {
                move_file(&self.output_path(from)?, &self.output_path(to)?)
            }
            CommitStep::Place { source_index } => {
                let rel = self.source_path(*source_index)?;
                let staged = self.source.entry_path(self.stage_dir, rel)?;
                move_file(&staged, &self.output_path(rel)?)
            }
            CommitStep::Overlay { source_index } => self.apply_overlay(*source_index),
        }
    }

    fn apply_overlay(&self, source_index: usize) -> Result<()> {
        let entry = self.source.file(source_index)?;
        let staged = self.source.entry_path(self.stage_dir, &entry.path)?;
        let output = self.output_path(&entry.path)?;

        let mut patch = BufReader::new(File::open(&staged).map_err(commit_error(&staged))?);
        let file = OpenOptions::new()
            .write(true)
            .open(&output)
            .map_err(commit_error(&output))?;
        let mut writer = BufWriter::new(file);
        let len = apply_overlay(&mut patch, &mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.set_len(len).map_err(commit_error(&output))?;
        file.sync_data()?;

        if len != entry.size {
            return Err(PatchError::SizeMismatch {
                path: entry.path.clone(),
                expected: entry.size,
                actual: len,
            });
        }
        set_mode(&output, entry.mode)?;
        Ok(())
    }

    fn delete_ghosts(&self) -> Result<Vec<PathBuf>> {
        let mut ghosts = ghosts(self.source, self.target);
        ghosts.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then_with(|| a.path.cmp(&b.path)));
        tracing::debug!("{} ghosts to delete", ghosts.len());

        let mut leftovers = Vec::new();
        for ghost in ghosts {
            let path = self.target.entry_path(self.output_dir, &ghost.path)?;
            let result = match ghost.kind {
                GhostKind::Dir => fs::remove_dir(&path),
                GhostKind::File | GhostKind::Symlink => fs::remove_file(&path),
            };
            match result {
                Ok(()) => tracing::trace!("Removed ghost {}", ghost.path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) if ghost.kind == GhostKind::Dir => {
                    tracing::warn!("Leaving directory {} behind: {}", path.display(), e);
                    leftovers.push(path);
                }
                Err(e) => return Err(PatchError::Commit { path, source: e }),
            }
        }
        Ok(leftovers)
    }
}

fn commit_error(path: &Path) -> impl FnOnce(io::Error) -> PatchError + '_ {
    move |source| PatchError::Commit {
        path: path.to_path_buf(),
        source,
    }
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(commit_error(parent))?;
    }
    fs::copy(from, to).map_err(commit_error(from))?;
    Ok(())
}

/// Rename `from` over `to`, falling back to copy and delete.
///
/// A missing `from` with an existing `to` counts as already done.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if from.symlink_metadata().is_err() && to.symlink_metadata().is_ok() {
        tracing::debug!("{} already moved", to.display());
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(commit_error(parent))?;
    }
    match fs::remove_file(to) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(commit_error(to)(e)),
    }
    if let Err(e) = fs::rename(from, to) {
        tracing::debug!("Rename {} failed ({}), copying instead", from.display(), e);
        fs::copy(from, to).map_err(commit_error(from))?;
        fs::remove_file(from).map_err(commit_error(from))?;
    }
    Ok(())
}

/// Hands out `<dest>.shipwright-swap-<n>` names that collide with nothing.
struct TempNames<'a> {
    output_dir: &'a Path,
    taken: HashSet<&'a str>,
    allocated: HashSet<String>,
}

impl<'a> TempNames<'a> {
    fn new(output_dir: &'a Path, source: &'a Container, target: &'a Container) -> Self {
        let taken = [source, target]
            .into_iter()
            .flat_map(|c| {
                c.files
                    .iter()
                    .map(|f| f.path.as_str())
                    .chain(c.dirs.iter().map(|d| d.path.as_str()))
                    .chain(c.symlinks.iter().map(|s| s.path.as_str()))
            })
            .collect();
        Self {
            output_dir,
            taken,
            allocated: HashSet::new(),
        }
    }

    fn allocate(&mut self, dest: &str) -> Result<String> {
        let mut n = 1u64;
        loop {
            let candidate = format!("{}{}{}", dest, SWAP_SUFFIX, n);
            let on_disk = Container::new()
                .entry_path(self.output_dir, &candidate)?
                .symlink_metadata()
                .is_ok();
            if !on_disk
                && !self.taken.contains(candidate.as_str())
                && !self.allocated.contains(&candidate)
            {
                self.allocated.insert(candidate.clone());
                return Ok(candidate);
            }
            n += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GhostKind {
    Dir,
    File,
    Symlink,
}

#[derive(Debug)]
struct Ghost {
    kind: GhostKind,
    path: String,
}

/// Paths of the old tree that the new tree no longer has
fn ghosts(source: &Container, target: &Container) -> Vec<Ghost> {
    let present: HashSet<&str> = source
        .files
        .iter()
        .map(|f| f.path.as_str())
        .chain(source.dirs.iter().map(|d| d.path.as_str()))
        .chain(source.symlinks.iter().map(|s| s.path.as_str()))
        .collect();

    let files = target.files.iter().map(|f| (GhostKind::File, &f.path));
    let links = target.symlinks.iter().map(|s| (GhostKind::Symlink, &s.path));
    let dirs = target.dirs.iter().map(|d| (GhostKind::Dir, &d.path));
    files
        .chain(links)
        .chain(dirs)
        .filter(|(_, path)| !present.contains(path.as_str()))
        .map(|(kind, path)| Ghost {
            kind,
            path: path.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bowl::Transposition;
    use tempfile::TempDir;

    fn containers(old: &[&str], new: &[&str]) -> (Container, Container) {
        let mut target = Container::new();
        for path in old {
            target.push_file(*path, 1);
        }
        let mut source = Container::new();
        for path in new {
            source.push_file(*path, 1);
        }
        (source, target)
    }

    fn transposition(source_index: usize, target_index: usize) -> Transposition {
        Transposition {
            source_index,
            target_index,
        }
    }

    #[test]
    fn test_swap_goes_through_temp_names() {
        let temp = TempDir::new().unwrap();
        let (source, target) = containers(&["a", "b"], &["a", "b"]);
        let state = OverlayCheckpoint {
            transpositions: vec![transposition(0, 1), transposition(1, 0)],
            ..Default::default()
        };
        let committer = Committer {
            source: &source,
            target: &target,
            output_dir: temp.path(),
            stage_dir: &temp.path().join("stage"),
            state: &state,
        };
        let steps = committer.plan().unwrap();
        assert_eq!(
            steps,
            vec![
                CommitStep::Rename {
                    from: "a".into(),
                    to: "b.shipwright-swap-1".into()
                },
                CommitStep::Rename {
                    from: "b".into(),
                    to: "a.shipwright-swap-1".into()
                },
                CommitStep::Rename {
                    from: "b.shipwright-swap-1".into(),
                    to: "b".into()
                },
                CommitStep::Rename {
                    from: "a.shipwright-swap-1".into(),
                    to: "a".into()
                },
            ]
        );
    }

    #[test]
    fn test_temp_names_skip_existing_paths() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("b.shipwright-swap-1"), b"squatter").unwrap();
        let (source, target) = containers(&["a", "b", "b.shipwright-swap-2"], &["a", "b"]);

        let mut names = TempNames::new(temp.path(), &source, &target);
        assert_eq!(names.allocate("b").unwrap(), "b.shipwright-swap-3");
        assert_eq!(names.allocate("b").unwrap(), "b.shipwright-swap-4");
    }

    #[test]
    fn test_duplicated_file_copies_then_renames() {
        let temp = TempDir::new().unwrap();
        let (source, target) = containers(&["orig"], &["copy1", "copy2"]);
        let state = OverlayCheckpoint {
            transpositions: vec![transposition(0, 0), transposition(1, 0)],
            ..Default::default()
        };
        let committer = Committer {
            source: &source,
            target: &target,
            output_dir: temp.path(),
            stage_dir: &temp.path().join("stage"),
            state: &state,
        };
        assert_eq!(
            committer.plan().unwrap(),
            vec![
                CommitStep::Copy {
                    from: "orig".into(),
                    to: "copy2".into()
                },
                CommitStep::Rename {
                    from: "orig".into(),
                    to: "copy1".into()
                },
            ]
        );
    }

    #[test]
    fn test_overlaid_original_is_copied_not_moved() {
        let temp = TempDir::new().unwrap();
        let (source, target) = containers(&["data"], &["data", "data.bak"]);
        let state = OverlayCheckpoint {
            transpositions: vec![transposition(1, 0)],
            overlay_files: vec![0],
            move_files: vec![],
        };
        let committer = Committer {
            source: &source,
            target: &target,
            output_dir: temp.path(),
            stage_dir: &temp.path().join("stage"),
            state: &state,
        };
        assert_eq!(
            committer.plan().unwrap(),
            vec![
                CommitStep::Copy {
                    from: "data".into(),
                    to: "data.bak".into()
                },
                CommitStep::Overlay { source_index: 0 },
            ]
        );
    }

    #[test]
    fn test_ghosts_detected() {
        let mut target = Container::new();
        target.push_dir("gone").push_file("gone/x", 1).push_file("kept", 1);
        let mut source = Container::new();
        source.push_file("kept", 1);

        let mut found: Vec<(GhostKind, String)> = ghosts(&source, &target)
            .into_iter()
            .map(|g| (g.kind, g.path))
            .collect();
        found.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            found,
            vec![
                (GhostKind::Dir, "gone".to_string()),
                (GhostKind::File, "gone/x".to_string())
            ]
        );
    }

    #[test]
    fn test_journal_sits_beside_stage_dir() {
        let temp = TempDir::new().unwrap();
        let stage = temp.path().join(".game.shipwright-stage");
        fs::create_dir_all(&stage).unwrap();
        let journal = Journal {
            version: JOURNAL_VERSION,
            state_hash: 7,
            state: OverlayCheckpoint {
                move_files: vec![3],
                ..Default::default()
            },
            steps: vec![CommitStep::Place { source_index: 3 }],
            completed: 0,
        };
        journal.save(&stage).unwrap();

        assert!(temp.path().join(".game.shipwright-stage.commit.json").is_file());
        assert_eq!(fs::read_dir(&stage).unwrap().count(), 0);
        let state = pending_state(&stage).unwrap().unwrap();
        assert_eq!(state.move_files, vec![3]);

        Journal::delete(&stage).unwrap();
        Journal::delete(&stage).unwrap();
        assert!(pending_state(&stage).unwrap().is_none());
    }

    #[test]
    fn test_move_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("from");
        let to = temp.path().join("nested/to");
        fs::write(&from, b"payload").unwrap();

        move_file(&from, &to).unwrap();
        move_file(&from, &to).unwrap();
        assert_eq!(fs::read(&to).unwrap(), b"payload");
        assert!(!from.exists());
    }
}
