use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Action failed for group {group}: {reason}")]
    Action { group: u64, reason: String },

    #[error("History CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("{0}")]
    Other(String),
}

/// Failure raised by a format filter while evaluating a group.
#[derive(Error, Debug)]
pub enum FilterError {
    /// Reading a file during dependency lookup failed. Assumed transient.
    #[error("IO fault: {0}")]
    Io(#[from] std::io::Error),

    /// The filter itself misbehaved (including a caught panic).
    #[error("filter fault: {0}")]
    Fault(String),
}
