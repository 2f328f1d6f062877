//! Per-format filters and the priority-ordered chain they form.

pub mod pattern;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::actions::GroupHandoff;
use crate::error::{Error, FilterError};
use crate::folder::{ImportFile, ImportFolder};
use crate::group::GroupId;
use crate::pipeline::CancellationToken;
use crate::properties::Properties;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FormatId(Arc<str>);

impl FormatId {
    pub fn new(id: &str) -> Self {
        Self(Arc::from(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FormatId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for FormatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decision of one format about one group for one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterVerdict {
    /// Not this format's group; ask the next filter.
    None,
    /// Claimed and complete.
    Import,
    /// Claimed and permanently unusable.
    Discard,
    /// Claimed, importable now, still waiting on optional dependencies.
    RetryOrImport,
    /// Claimed, still waiting on required dependencies or a transient fault.
    RetryOrDiscard,
}

impl FilterVerdict {
    pub fn is_claim(&self) -> bool {
        !matches!(self, FilterVerdict::None)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FilterVerdict::Import | FilterVerdict::Discard)
    }

    pub fn is_retry(&self) -> bool {
        matches!(
            self,
            FilterVerdict::RetryOrImport | FilterVerdict::RetryOrDiscard
        )
    }

    /// Terminal verdict a retry verdict resolves to once its wait runs out.
    pub fn promoted(&self) -> Option<FilterVerdict> {
        match self {
            FilterVerdict::RetryOrImport => Some(FilterVerdict::Import),
            FilterVerdict::RetryOrDiscard => Some(FilterVerdict::Discard),
            _ => None,
        }
    }
}

impl fmt::Display for FilterVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A verdict plus what the filter found while reaching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    pub verdict: FilterVerdict,
    /// Part-relative paths of files the group depends on.
    pub dependencies: Vec<String>,
    /// Human readable names of dependencies not found yet.
    pub missing: Vec<String>,
    pub note: Option<String>,
}

impl FilterOutcome {
    pub fn new(verdict: FilterVerdict) -> Self {
        Self {
            verdict,
            dependencies: Vec::new(),
            missing: Vec::new(),
            note: None,
        }
    }

    pub fn none() -> Self {
        Self::new(FilterVerdict::None)
    }

    pub fn import() -> Self {
        Self::new(FilterVerdict::Import)
    }

    pub fn discard(reason: impl Into<String>) -> Self {
        Self::new(FilterVerdict::Discard).with_note(reason)
    }

    pub fn retry_or_import() -> Self {
        Self::new(FilterVerdict::RetryOrImport)
    }

    pub fn retry_or_discard() -> Self {
        Self::new(FilterVerdict::RetryOrDiscard)
    }

    pub fn with_dependency(mut self, relative_path: impl Into<String>) -> Self {
        self.dependencies.push(relative_path.into());
        self
    }

    pub fn with_missing(mut self, name: impl Into<String>) -> Self {
        self.missing.push(name.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// What a filter sees of the group it is judging.
pub struct FilterContext<'a> {
    part: &'a ImportFolder,
    group: GroupId,
    primary: &'a ImportFile,
    dependencies: &'a [ImportFile],
    cancel: &'a CancellationToken,
}

impl<'a> FilterContext<'a> {
    pub fn new(
        part: &'a ImportFolder,
        group: GroupId,
        primary: &'a ImportFile,
        dependencies: &'a [ImportFile],
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            part,
            group,
            primary,
            dependencies,
            cancel,
        }
    }

    /// Root folder of the import part.
    pub fn part(&self) -> &'a ImportFolder {
        self.part
    }

    pub fn group_id(&self) -> GroupId {
        self.group
    }

    pub fn primary(&self) -> &'a ImportFile {
        self.primary
    }

    /// Dependencies attached on earlier passes.
    pub fn dependencies(&self) -> &'a [ImportFile] {
        self.dependencies
    }

    /// The folder holding the primary file.
    pub fn primary_folder(&self) -> Option<&'a ImportFolder> {
        self.part.resolve(self.primary.folder_path())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Classifies candidate groups for one format. Must not mutate files.
pub trait ImportFilter: Send + Sync {
    fn evaluate(&self, ctx: &FilterContext<'_>) -> Result<FilterOutcome, FilterError>;
}

/// Format-specific parse stage run on imported groups.
pub trait ImportParser: Send + Sync {
    fn parse(&self, handoff: &GroupHandoff) -> Result<(), Error>;
}

pub type FilterFactory = Arc<dyn Fn() -> Box<dyn ImportFilter> + Send + Sync>;
pub type ParserFactory = Arc<dyn Fn() -> Box<dyn ImportParser> + Send + Sync>;

/// Registration record for one data format.
#[derive(Clone)]
pub struct FormatDescriptor {
    id: FormatId,
    priority: i32,
    properties: Properties,
    filter_factory: FilterFactory,
    parser_factory: Option<ParserFactory>,
}

impl FormatDescriptor {
    pub fn new<F>(id: &str, priority: i32, filter_factory: F) -> Self
    where
        F: Fn() -> Box<dyn ImportFilter> + Send + Sync + 'static,
    {
        Self {
            id: FormatId::new(id),
            priority,
            properties: Properties::new(),
            filter_factory: Arc::new(filter_factory),
            parser_factory: None,
        }
    }

    pub fn with_parser<F>(mut self, parser_factory: F) -> Self
    where
        F: Fn() -> Box<dyn ImportParser> + Send + Sync + 'static,
    {
        self.parser_factory = Some(Arc::new(parser_factory));
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn id(&self) -> &FormatId {
        &self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn create_filter(&self) -> Box<dyn ImportFilter> {
        (self.filter_factory)()
    }

    pub fn create_parser(&self) -> Option<Box<dyn ImportParser>> {
        self.parser_factory.as_ref().map(|factory| factory())
    }
}

impl fmt::Debug for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatDescriptor")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("properties", &self.properties)
            .field("has_parser", &self.parser_factory.is_some())
            .finish()
    }
}

/// Collects format registrations before the pipeline starts.
#[derive(Debug, Default)]
pub struct FormatRegistry {
    descriptors: Vec<FormatDescriptor>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: FormatDescriptor) -> Result<(), Error> {
        if self.descriptors.iter().any(|d| d.id == descriptor.id) {
            return Err(Error::Registration(format!(
                "format '{}' is already registered",
                descriptor.id
            )));
        }
        self.descriptors.push(descriptor);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Freeze the registrations into a chain, instantiating one filter per
    /// format. Consumes the registry, so nothing can register afterwards.
    pub fn into_chain(self) -> FilterChain {
        let mut descriptors = self.descriptors;
        // Stable: equal priorities keep registration order.
        descriptors.sort_by(|a, b| b.priority.cmp(&a.priority));
        let entries = descriptors
            .into_iter()
            .map(|descriptor| {
                let filter = descriptor.create_filter();
                ChainEntry { descriptor, filter }
            })
            .collect();
        FilterChain { entries }
    }
}

pub struct ChainEntry {
    descriptor: FormatDescriptor,
    filter: Box<dyn ImportFilter>,
}

impl ChainEntry {
    pub fn descriptor(&self) -> &FormatDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> &FormatId {
        &self.descriptor.id
    }

    /// Run the filter, turning a panic into a [`FilterError::Fault`].
    pub fn invoke(&self, ctx: &FilterContext<'_>) -> Result<FilterOutcome, FilterError> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.filter.evaluate(ctx))) {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic with non-string payload".to_string());
                Err(FilterError::Fault(format!("panicked: {}", message)))
            }
        }
    }
}

/// Filters in descending priority order. Fixed for the engine's lifetime.
pub struct FilterChain {
    entries: Vec<ChainEntry>,
}

impl FilterChain {
    pub fn entries(&self) -> &[ChainEntry] {
        &self.entries
    }

    pub fn get(&self, id: &FormatId) -> Option<&ChainEntry> {
        self.entries.iter().find(|entry| entry.id() == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (e.id(), e.descriptor.priority)))
            .finish()
    }
}
