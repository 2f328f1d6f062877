pub mod actions;
pub mod config;
pub mod engine;
pub mod error;
pub mod folder;
pub mod format;
pub mod group;
pub mod history;
pub mod pipeline;
pub mod progress;
pub mod properties;

pub use actions::{DispositionHandler, DryRun, FormatDispatch, GroupHandoff};
pub use config::AppConfig;
pub use engine::{ClassificationEngine, PassReport, PromotionPolicy};
pub use error::{Error, FilterError};
pub use folder::scan::{DiskFolder, FolderSource, MemoryFolder};
pub use folder::{ImportFile, ImportFolder};
pub use format::{
    FilterChain, FilterContext, FilterOutcome, FilterVerdict, FormatDescriptor, FormatId,
    FormatRegistry, ImportFilter, ImportParser,
};
pub use group::{GroupId, GroupStatus, ImportGroup};
pub use history::{HistoryEntry, HistorySink, Severity};
pub use pipeline::{CancellationToken, ImportPart, Pipeline};
pub use progress::{PipelineObserver, SilentObserver};
pub use properties::Properties;
