use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::folder::ImportFile;
use crate::format::{FilterVerdict, FormatId};
use crate::history::{HistoryEntry, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(u64);

impl GroupId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{}", self.0)
    }
}

/// Classification state of a group.
///
/// `Unclaimed` runs the full chain each pass, the two retry states run only
/// the owning format's filter, `Importing`/`Discarding` are handed to an
/// action, and `Imported`/`Discarded` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupStatus {
    Unclaimed,
    Importing,
    Discarding,
    RetryImport,
    RetryDiscard,
    Imported,
    Discarded,
}

impl GroupStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GroupStatus::Imported | GroupStatus::Discarded)
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, GroupStatus::RetryImport | GroupStatus::RetryDiscard)
    }

    /// The non-terminal status a claiming verdict moves a group into.
    pub fn for_verdict(verdict: FilterVerdict) -> GroupStatus {
        match verdict {
            FilterVerdict::None => GroupStatus::Unclaimed,
            FilterVerdict::Import => GroupStatus::Importing,
            FilterVerdict::Discard => GroupStatus::Discarding,
            FilterVerdict::RetryOrImport => GroupStatus::RetryImport,
            FilterVerdict::RetryOrDiscard => GroupStatus::RetryDiscard,
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A primary file plus the dependencies its owning format resolved, with
/// the classification state carried between passes.
#[derive(Debug, Clone)]
pub struct ImportGroup {
    id: GroupId,
    primary: ImportFile,
    dependencies: Vec<ImportFile>,
    pub(crate) status: GroupStatus,
    pub(crate) owner: Option<FormatId>,
    first_seen_at: DateTime<Utc>,
    pub(crate) last_evaluated_at: Option<DateTime<Utc>>,
    pub(crate) retry_elapsed: Duration,
    pub(crate) last_verdict: Option<FilterVerdict>,
    pub(crate) last_dependency_keys: Vec<String>,
    pub(crate) missing: Vec<String>,
    pub(crate) io_faulted: bool,
    pub(crate) skip_next: Vec<FormatId>,
    history: Vec<HistoryEntry>,
}

impl ImportGroup {
    pub fn new(id: GroupId, primary: ImportFile) -> Self {
        Self {
            id,
            primary,
            dependencies: Vec::new(),
            status: GroupStatus::Unclaimed,
            owner: None,
            first_seen_at: Utc::now(),
            last_evaluated_at: None,
            retry_elapsed: Duration::ZERO,
            last_verdict: None,
            last_dependency_keys: Vec::new(),
            missing: Vec::new(),
            io_faulted: false,
            skip_next: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn primary(&self) -> &ImportFile {
        &self.primary
    }

    pub fn dependencies(&self) -> &[ImportFile] {
        &self.dependencies
    }

    /// Primary first, then dependencies in attach order.
    pub fn files(&self) -> impl Iterator<Item = &ImportFile> {
        std::iter::once(&self.primary).chain(self.dependencies.iter())
    }

    pub fn status(&self) -> GroupStatus {
        self.status
    }

    pub fn owner(&self) -> Option<&FormatId> {
        self.owner.as_ref()
    }

    pub fn first_seen_at(&self) -> DateTime<Utc> {
        self.first_seen_at
    }

    pub fn last_evaluated_at(&self) -> Option<DateTime<Utc>> {
        self.last_evaluated_at
    }

    pub fn retry_elapsed(&self) -> Duration {
        self.retry_elapsed
    }

    pub fn last_verdict(&self) -> Option<FilterVerdict> {
        self.last_verdict
    }

    /// Names the owning format reported as still missing on the last pass.
    pub fn missing(&self) -> &[String] {
        &self.missing
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub(crate) fn record(&mut self, severity: Severity, message: impl Into<String>) {
        self.history
            .push(HistoryEntry::new(self.id, severity, message));
    }

    pub(crate) fn take_history(&mut self) -> Vec<HistoryEntry> {
        std::mem::take(&mut self.history)
    }

    pub(crate) fn refresh_primary(&mut self, file: ImportFile) {
        self.primary = file;
    }

    pub(crate) fn set_dependencies(&mut self, dependencies: Vec<ImportFile>) {
        self.dependencies = dependencies;
    }

    /// Drop dependencies the predicate rejects, returning their paths.
    pub(crate) fn retain_dependencies(
        &mut self,
        mut keep: impl FnMut(&ImportFile) -> bool,
    ) -> Vec<String> {
        let mut dropped = Vec::new();
        self.dependencies.retain(|dep| {
            let kept = keep(dep);
            if !kept {
                dropped.push(dep.relative_path().to_string());
            }
            kept
        });
        dropped
    }

    pub(crate) fn release(&mut self) {
        self.status = GroupStatus::Unclaimed;
        self.owner = None;
        self.retry_elapsed = Duration::ZERO;
        self.last_verdict = Some(FilterVerdict::None);
        self.last_dependency_keys.clear();
        self.missing.clear();
        self.io_faulted = false;
        self.dependencies.clear();
    }
}
