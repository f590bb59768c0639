//! File tree manifests.
//!
//! A [`Container`] is an ordered list of files, directories and symlinks with
//! `/`-separated paths relative to the tree root. File order is significant:
//! file indices in patches and signatures refer to positions in `files`.

use crate::error::{format_bytes, PatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Default mode for entries created without explicit permissions
pub const DEFAULT_FILE_MODE: u32 = 0o644;
pub const DEFAULT_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub mode: u32,
    pub size: u64,
    /// Byte offset of this file if the container were laid out end to end
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub path: String,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkEntry {
    pub path: String,
    pub mode: u32,
    pub dest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub files: Vec<FileEntry>,
    pub dirs: Vec<DirEntry>,
    pub symlinks: Vec<SymlinkEntry>,
    /// Sum of all file sizes
    pub size: u64,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a file, keeping `offset` and `size` consistent.
    pub fn push_file(&mut self, path: impl Into<String>, size: u64) -> &mut Self {
        self.files.push(FileEntry {
            path: path.into(),
            mode: DEFAULT_FILE_MODE,
            size,
            offset: self.size,
        });
        self.size += size;
        self
    }

    pub fn push_dir(&mut self, path: impl Into<String>) -> &mut Self {
        self.dirs.push(DirEntry {
            path: path.into(),
            mode: DEFAULT_DIR_MODE,
        });
        self
    }

    pub fn push_symlink(&mut self, path: impl Into<String>, dest: impl Into<String>) -> &mut Self {
        self.symlinks.push(SymlinkEntry {
            path: path.into(),
            mode: 0o777,
            dest: dest.into(),
        });
        self
    }

    /// Walk a directory into a container.
    ///
    /// Entries are sorted by path so two walks of the same tree produce the
    /// same container. Symlinks are recorded, never followed.
    pub fn walk(root: &Path) -> Result<Self> {
        let meta = fs::metadata(root)?;
        if !meta.is_dir() {
            return Err(PatchError::InvalidInput(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let mut container = Container::new();
        for entry in WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                let kind = e
                    .io_error()
                    .map(|io| io.kind())
                    .unwrap_or(std::io::ErrorKind::Other);
                PatchError::Io(std::io::Error::new(kind, e.to_string()))
            })?;
            let rel = relative_slash_path(root, entry.path())?;
            let meta = entry.path().symlink_metadata()?;
            let mode = file_mode(&meta);
            let file_type = meta.file_type();

            if file_type.is_symlink() {
                let dest = fs::read_link(entry.path())?;
                container.symlinks.push(SymlinkEntry {
                    path: rel,
                    mode,
                    dest: dest.to_string_lossy().replace('\\', "/"),
                });
            } else if file_type.is_dir() {
                container.dirs.push(DirEntry { path: rel, mode });
            } else if file_type.is_file() {
                container.files.push(FileEntry {
                    path: rel,
                    mode,
                    size: meta.len(),
                    offset: container.size,
                });
                container.size += meta.len();
            } else {
                tracing::debug!("Skipping special file {}", entry.path().display());
            }
        }

        tracing::debug!("Walked {}: {}", root.display(), container.stats());
        Ok(container)
    }

    /// Create every directory and symlink under `root`.
    ///
    /// Files are not created here; writers create them as they are produced.
    pub fn prepare(&self, root: &Path) -> Result<()> {
        fs::create_dir_all(root)?;
        for dir in &self.dirs {
            let path = self.entry_path(root, &dir.path)?;
            fs::create_dir_all(&path)?;
            set_mode(&path, dir.mode)?;
        }
        for file in &self.files {
            let path = self.entry_path(root, &file.path)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        for link in &self.symlinks {
            let path = self.entry_path(root, &link.path)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            ensure_symlink(&path, &link.dest)?;
        }
        Ok(())
    }

    /// Resolve an entry path below `root`, rejecting absolute paths and `..`.
    pub fn entry_path(&self, root: &Path, rel: &str) -> Result<PathBuf> {
        let mut path = root.to_path_buf();
        for part in rel.split('/') {
            match part {
                "" | "." => continue,
                ".." => {
                    return Err(PatchError::Corrupt(format!(
                        "container path escapes root: {}",
                        rel
                    )))
                }
                _ => path.push(part),
            }
        }
        if path == root {
            return Err(PatchError::Corrupt(format!("empty container path: {:?}", rel)));
        }
        Ok(path)
    }

    pub fn file(&self, index: usize) -> Result<&FileEntry> {
        self.files.get(index).ok_or_else(|| {
            PatchError::Corrupt(format!(
                "file index {} out of range ({} files)",
                index,
                self.files.len()
            ))
        })
    }

    /// Map of file path to file index
    pub fn file_indices_by_path(&self) -> HashMap<&str, usize> {
        self.files
            .iter()
            .enumerate()
            .map(|(i, f)| (f.path.as_str(), i))
            .collect()
    }

    /// Human-readable summary, e.g. "3 files, 1 dirs, 0 symlinks (12.00 KB)"
    pub fn stats(&self) -> String {
        format!(
            "{} files, {} dirs, {} symlinks ({})",
            self.files.len(),
            self.dirs.len(),
            self.symlinks.len(),
            format_bytes(self.size)
        )
    }
}

fn relative_slash_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        PatchError::InvalidInput(format!(
            "{} is not below {}",
            path.display(),
            root.display()
        ))
    })?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        DEFAULT_DIR_MODE
    } else {
        DEFAULT_FILE_MODE
    }
}

/// Apply a container mode to a path (no-op off unix)
#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode != 0 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Make `path` a symlink pointing at `dest`, replacing whatever is there.
#[cfg(unix)]
pub(crate) fn ensure_symlink(path: &Path, dest: &str) -> Result<()> {
    if let Ok(meta) = path.symlink_metadata() {
        if meta.file_type().is_symlink() {
            if fs::read_link(path)?.as_os_str() == std::ffi::OsStr::new(dest) {
                return Ok(());
            }
            fs::remove_file(path)?;
        } else if meta.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
    }
    std::os::unix::fs::symlink(dest, path)?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn ensure_symlink(path: &Path, dest: &str) -> Result<()> {
    tracing::warn!(
        "Symlinks are not supported on this platform, skipping {} -> {}",
        path.display(),
        dest
    );
    Ok(())
}
