//! Hand-off of terminal groups to the import and deletion stages.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::folder::ImportFile;
use crate::format::{FormatDescriptor, ImportParser};
use crate::group::GroupId;

/// A terminal group leaving the engine.
#[derive(Debug, Clone)]
pub struct GroupHandoff {
    pub group: GroupId,
    /// Owning format. `None` for groups no format ever claimed.
    pub format: Option<FormatDescriptor>,
    pub primary: ImportFile,
    pub dependencies: Vec<ImportFile>,
    /// Dependencies still missing when the group was resolved.
    pub missing: Vec<String>,
    /// The group got here through forced promotion or expiry.
    pub forced: bool,
}

impl GroupHandoff {
    pub fn files(&self) -> impl Iterator<Item = &ImportFile> {
        std::iter::once(&self.primary).chain(self.dependencies.iter())
    }

    pub fn format_name(&self) -> &str {
        self.format
            .as_ref()
            .map(|f| f.id().as_str())
            .unwrap_or("unknown")
    }
}

/// Receives every group the engine resolves.
pub trait DispositionHandler: Send + Sync {
    fn import(&self, handoff: &GroupHandoff) -> Result<(), Error>;
    fn discard(&self, handoff: &GroupHandoff) -> Result<(), Error>;
}

/// Logs dispositions and touches nothing.
pub struct DryRun;

impl DispositionHandler for DryRun {
    fn import(&self, handoff: &GroupHandoff) -> Result<(), Error> {
        info!(
            "[dry run] would import {} as {} ({} files)",
            handoff.primary.relative_path(),
            handoff.format_name(),
            handoff.files().count()
        );
        Ok(())
    }

    fn discard(&self, handoff: &GroupHandoff) -> Result<(), Error> {
        info!(
            "[dry run] would delete {} ({} files)",
            handoff.primary.relative_path(),
            handoff.files().count()
        );
        Ok(())
    }
}

/// Runs the owning format's parser on import and deletes discarded files.
pub struct FormatDispatch {
    delete_discarded: bool,
}

impl FormatDispatch {
    pub fn new(delete_discarded: bool) -> Self {
        Self { delete_discarded }
    }
}

impl DispositionHandler for FormatDispatch {
    fn import(&self, handoff: &GroupHandoff) -> Result<(), Error> {
        let parser = handoff.format.as_ref().and_then(|f| f.create_parser());
        match parser {
            Some(parser) => parser.parse(handoff),
            None => {
                debug!(
                    "Format {} has no parse stage, {} left in place",
                    handoff.format_name(),
                    handoff.primary.relative_path()
                );
                Ok(())
            }
        }
    }

    fn discard(&self, handoff: &GroupHandoff) -> Result<(), Error> {
        if !self.delete_discarded {
            return Ok(());
        }
        for file in handoff.files() {
            let Some(path) = file.disk_path() else {
                continue;
            };
            match fs::remove_file(path) {
                Ok(()) => debug!("deleted: {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("File '{}' no longer exists", path.display())
                }
                Err(e) => {
                    return Err(Error::Action {
                        group: handoff.group.value(),
                        reason: format!("failed to remove '{}': {}", path.display(), e),
                    })
                }
            }
        }
        Ok(())
    }
}

/// Parse stage that moves a group's files under `target`, keeping their
/// part-relative layout.
pub struct MoveParser {
    target: PathBuf,
}

impl MoveParser {
    pub fn new(target: PathBuf) -> Self {
        Self { target }
    }
}

impl ImportParser for MoveParser {
    fn parse(&self, handoff: &GroupHandoff) -> Result<(), Error> {
        for file in handoff.files() {
            let Some(source) = file.disk_path() else {
                continue;
            };
            let destination = self.target.join(file.relative_path());
            move_file(source, &destination).map_err(|e| Error::Action {
                group: handoff.group.value(),
                reason: format!("failed to move '{}': {}", source.display(), e),
            })?;
            debug!("moved {} -> {}", source.display(), destination.display());
        }
        Ok(())
    }
}

fn move_file(source: &Path, destination: &Path) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    // rename fails across devices; fall back to copy + remove
    if fs::rename(source, destination).is_err() {
        fs::copy(source, destination)?;
        fs::remove_file(source)?;
    }
    Ok(())
}
