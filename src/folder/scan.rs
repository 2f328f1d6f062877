use chrono::{DateTime, Utc};
use dashmap::DashMap;
use glob::Pattern;
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error};

use super::{ImportFile, ImportFolder};
use crate::error::Error;

/// Pull-side source of folder snapshots. Queried once per tick.
pub trait FolderSource: Send + Sync {
    fn snapshot(&self) -> Result<ImportFolder, Error>;
}

/// Snapshots a directory tree on disk, skipping symlinks and anything
/// matching an ignore glob. A file's discovery time is the first snapshot
/// that saw it, not its mtime.
pub struct DiskFolder {
    root: PathBuf,
    ignore_patterns: Vec<Pattern>,
    first_seen: DashMap<String, DateTime<Utc>>,
}

impl DiskFolder {
    pub fn new(root: impl Into<PathBuf>, ignore_globs: &[String]) -> Self {
        let ignore_patterns = ignore_globs
            .iter()
            .filter_map(|glob| match Pattern::new(glob) {
                Ok(p) => Some(p),
                Err(e) => {
                    error!("Invalid glob pattern '{}': {}", glob, e);
                    None
                }
            })
            .collect();

        Self {
            root: root.into(),
            ignore_patterns,
            first_seen: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FolderSource for DiskFolder {
    fn snapshot(&self) -> Result<ImportFolder, Error> {
        let found: DashMap<String, ImportFile> = DashMap::new();
        visit_dirs(&self.root, &self.root, &found, &self.ignore_patterns)?;
        debug!("Snapshot of {} holds {} files", self.root.display(), found.len());

        let now = Utc::now();
        self.first_seen.retain(|path, _| found.contains_key(path));
        let files = found.into_iter().map(|(relative, file)| {
            let seen = *self.first_seen.entry(relative).or_insert(now);
            file.discovered(seen)
        });
        Ok(ImportFolder::from_files(files))
    }
}

fn visit_dirs(
    root: &Path,
    dir: &Path,
    found: &DashMap<String, ImportFile>,
    ignore_patterns: &[Pattern],
) -> io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }

    if ignore_patterns
        .iter()
        .any(|pattern| pattern.matches_path(dir))
    {
        return Ok(());
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() == io::ErrorKind::PermissionDenied {
                error!(
                    "Access denied reading directory {}: {}",
                    dir.display(),
                    err
                );
                return Ok(());
            } else {
                return Err(io::Error::new(
                    err.kind(),
                    format!("Error reading directory {}: {}", dir.display(), err),
                ));
            }
        }
    };

    entries.par_bridge().try_for_each(|entry_result| {
        let entry = entry_result.map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("Error reading entry in directory {}: {}", dir.display(), err),
            )
        })?;

        let path = entry.path();
        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            // Files may vanish between listing and stat; the next tick sees it.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(io::Error::new(
                    err.kind(),
                    format!("Error getting metadata for {}: {}", path.display(), err),
                ))
            }
        };

        if metadata.file_type().is_symlink() {
            return Ok(());
        }

        if metadata.is_dir() {
            visit_dirs(root, &path, found, ignore_patterns)?;
        } else if !ignore_patterns
            .iter()
            .any(|pattern| pattern.matches_path(&path))
        {
            let relative = relative_key(root, &path);
            let file = ImportFile::on_disk(&relative, path, metadata.len(), Utc::now());
            found.insert(relative, file);
        }
        Ok(())
    })?;

    Ok(())
}

fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// In-memory source whose file set can change between ticks.
#[derive(Default)]
pub struct MemoryFolder {
    files: Mutex<Vec<ImportFile>>,
}

impl MemoryFolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file by relative path.
    pub fn add(&self, file: ImportFile) {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.retain(|f| f.relative_path() != file.relative_path());
        files.push(file);
    }

    pub fn remove(&self, relative_path: &str) {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.retain(|f| f.relative_path() != relative_path);
    }
}

impl FolderSource for MemoryFolder {
    fn snapshot(&self) -> Result<ImportFolder, Error> {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        Ok(ImportFolder::from_files(files.iter().cloned()))
    }
}

impl FolderSource for ImportFolder {
    fn snapshot(&self) -> Result<ImportFolder, Error> {
        Ok(self.clone())
    }
}
