use std::time::Duration;
use thiserror::Error;

/// Main error type for the docklog multiplexer
#[derive(Debug, Error)]
pub enum DocklogError {
    // Session setup errors
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    // Per-source errors
    #[error("Could not find container '{0}'")]
    NotFound(String),

    #[error("Failed to connect to daemon: {0}")]
    ConnectionError(String),

    #[error("Source '{identity}' has held a partial line for {elapsed:?}")]
    PartialLineTimeout { identity: String, elapsed: Duration },

    #[error("None of the requested containers could be reached")]
    NoReachableSources,

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl DocklogError {
    /// Whether this error aborts the whole session rather than a single source
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DocklogError::ConnectionError(_)
                | DocklogError::ConfigurationError(_)
                | DocklogError::NoReachableSources
        )
    }
}

/// Result type alias for docklog operations
pub type Result<T> = std::result::Result<T, DocklogError>;
