//! Read-only view over the files dropped into one import part.
//!
//! An [`ImportFolder`] is a snapshot: it is rebuilt from the source on every
//! tick and never touches the file system when queried.

pub mod scan;

use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::error::Error;

const NAME_MATCH: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Where the bytes of an [`ImportFile`] live. Content is only read on demand.
#[derive(Clone)]
enum DataSource {
    Disk(PathBuf),
    Memory(Arc<[u8]>),
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Disk(path) => write!(f, "Disk({})", path.display()),
            DataSource::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
        }
    }
}

/// A single file inside an import part.
#[derive(Debug, Clone)]
pub struct ImportFile {
    name: String,
    relative_path: String,
    discovered_at: DateTime<Utc>,
    size: u64,
    source: DataSource,
}

impl ImportFile {
    /// A file backed by `path` on disk. `relative_path` uses `/` separators and
    /// is relative to the part root.
    pub fn on_disk(
        relative_path: &str,
        path: PathBuf,
        size: u64,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        Self::new(relative_path, DataSource::Disk(path), size, discovered_at)
    }

    /// A file whose content is held in memory. Used by tests and by sources
    /// that are not backed by a directory.
    pub fn in_memory(relative_path: &str, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Arc<[u8]> = Arc::from(bytes.into());
        let size = bytes.len() as u64;
        Self::new(relative_path, DataSource::Memory(bytes), size, Utc::now())
    }

    fn new(
        relative_path: &str,
        source: DataSource,
        size: u64,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        let relative_path = relative_path.trim_matches('/').to_string();
        let name = relative_path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            name,
            relative_path,
            discovered_at,
            size,
            source,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path relative to the part root. Unique within a snapshot, so it also
    /// serves as the file's identity across ticks.
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Relative path of the folder holding this file (`""` for the root).
    pub fn folder_path(&self) -> &str {
        match self.relative_path.rfind('/') {
            Some(idx) => &self.relative_path[..idx],
            None => "",
        }
    }

    /// File name without its last extension.
    pub fn stem(&self) -> &str {
        match self.name.rfind('.') {
            Some(idx) if idx > 0 => &self.name[..idx],
            _ => &self.name,
        }
    }

    pub fn discovered_at(&self) -> DateTime<Utc> {
        self.discovered_at
    }

    pub(crate) fn discovered(mut self, at: DateTime<Utc>) -> Self {
        self.discovered_at = at;
        self
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// On-disk location, if the file is backed by one.
    pub fn disk_path(&self) -> Option<&PathBuf> {
        match &self.source {
            DataSource::Disk(path) => Some(path),
            DataSource::Memory(_) => None,
        }
    }

    /// Open a stream over the file content.
    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        match &self.source {
            DataSource::Disk(path) => Ok(Box::new(File::open(path)?)),
            DataSource::Memory(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
        }
    }
}

/// A folder of import files, ordered by name, with nested folders.
#[derive(Debug, Clone, Default)]
pub struct ImportFolder {
    name: String,
    relative_path: String,
    files: Vec<ImportFile>,
    folders: Vec<ImportFolder>,
    file_index: HashMap<String, usize>,
    folder_index: HashMap<String, usize>,
}

impl ImportFolder {
    /// An empty part folder.
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a folder tree from files carrying part-relative paths.
    pub fn from_files(files: impl IntoIterator<Item = ImportFile>) -> Self {
        let mut root = Self::root();
        for file in files {
            let dir = file.folder_path().to_string();
            root.folder_mut(&dir).files.push(file);
        }
        root.finalize();
        root
    }

    fn folder_mut(&mut self, relative_dir: &str) -> &mut ImportFolder {
        let mut current = self;
        for component in relative_dir.split('/').filter(|c| !c.is_empty()) {
            let idx = match current.folders.iter().position(|f| f.name == component) {
                Some(idx) => idx,
                None => {
                    let relative_path = if current.relative_path.is_empty() {
                        component.to_string()
                    } else {
                        format!("{}/{}", current.relative_path, component)
                    };
                    current.folders.push(ImportFolder {
                        name: component.to_string(),
                        relative_path,
                        ..Default::default()
                    });
                    current.folders.len() - 1
                }
            };
            current = &mut current.folders[idx];
        }
        current
    }

    fn finalize(&mut self) {
        self.files.sort_by(|a, b| a.name.cmp(&b.name));
        self.folders.sort_by(|a, b| a.name.cmp(&b.name));

        // First entry wins when two names differ only by case.
        self.file_index.clear();
        for (idx, file) in self.files.iter().enumerate() {
            self.file_index.entry(file.name.to_ascii_lowercase()).or_insert(idx);
        }
        self.folder_index.clear();
        for (idx, folder) in self.folders.iter().enumerate() {
            self.folder_index
                .entry(folder.name.to_ascii_lowercase())
                .or_insert(idx);
        }

        for folder in &mut self.folders {
            folder.finalize();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn is_root(&self) -> bool {
        self.relative_path.is_empty()
    }

    /// Files directly in this folder, ordered by name. Restartable.
    pub fn get_files(&self) -> std::slice::Iter<'_, ImportFile> {
        self.files.iter()
    }

    pub fn get_folders(&self) -> std::slice::Iter<'_, ImportFolder> {
        self.folders.iter()
    }

    /// Case-insensitive exact lookup in this folder. Only ASCII letters fold,
    /// the same as [`find_files`](Self::find_files).
    pub fn find_file(&self, name: &str) -> Option<&ImportFile> {
        self.file_index
            .get(&name.to_ascii_lowercase())
            .map(|&idx| &self.files[idx])
    }

    /// Case-insensitive wildcard lookup in this folder. `*` matches any run
    /// of characters and `?` exactly one; every other character is literal.
    pub fn find_files(&self, pattern: &str) -> Vec<&ImportFile> {
        match name_pattern(pattern) {
            Ok(compiled) => self
                .files
                .iter()
                .filter(|file| compiled.matches_with(&file.name, NAME_MATCH))
                .collect(),
            Err(e) => {
                warn!("{}", e);
                Vec::new()
            }
        }
    }

    /// Case-insensitive lookup of a direct subfolder.
    pub fn folder(&self, name: &str) -> Option<&ImportFolder> {
        self.folder_index
            .get(&name.to_ascii_lowercase())
            .map(|&idx| &self.folders[idx])
    }

    /// Walk down to a nested folder by relative path (`""` is this folder).
    pub fn resolve(&self, relative_dir: &str) -> Option<&ImportFolder> {
        relative_dir
            .split('/')
            .filter(|c| !c.is_empty())
            .try_fold(self, |folder, component| folder.folder(component))
    }

    /// Look up a file anywhere below this folder by its relative path.
    pub fn file_at(&self, relative_path: &str) -> Option<&ImportFile> {
        let (dir, name) = match relative_path.rfind('/') {
            Some(idx) => (&relative_path[..idx], &relative_path[idx + 1..]),
            None => ("", relative_path),
        };
        let folder = self.resolve(dir)?;
        match folder.find_file(name) {
            Some(file) if file.relative_path == relative_path => Some(file),
            _ => folder.files.iter().find(|f| f.relative_path == relative_path),
        }
    }

    /// Every file in the tree: this folder's files, then each subfolder's.
    pub fn all_files(&self) -> Vec<&ImportFile> {
        let mut out = Vec::new();
        self.collect_files(&mut out);
        out
    }

    fn collect_files<'a>(&'a self, out: &mut Vec<&'a ImportFile>) {
        out.extend(self.files.iter());
        for folder in &self.folders {
            folder.collect_files(out);
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.len() + self.folders.iter().map(|f| f.file_count()).sum::<usize>()
    }
}

/// Compile a file-name wildcard into a glob pattern. Only `*` and `?` are
/// special; brackets are escaped and runs of `*` collapse to one.
pub fn name_pattern(pattern: &str) -> Result<Pattern, Error> {
    let mut escaped = String::with_capacity(pattern.len());
    let mut previous_star = false;
    for ch in pattern.chars() {
        match ch {
            '*' if previous_star => continue,
            '[' => escaped.push_str("[[]"),
            ']' => escaped.push_str("[]]"),
            _ => escaped.push(ch),
        }
        previous_star = ch == '*';
    }
    Pattern::new(&escaped).map_err(|e| Error::Pattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Case-insensitive wildcard test of a single name.
pub fn name_matches(pattern: &Pattern, name: &str) -> bool {
    pattern.matches_with(name, NAME_MATCH)
}
