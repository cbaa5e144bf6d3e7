//! Error handling for the filter chain
//!
//! This module defines the error taxonomy shared by every stage, a compact
//! [`ErrorKind`] used to mark failed works, and a Result alias.

use crate::filter::{FilterId, FilterState};
use thiserror::Error;

/// Main error type for filter chain operations
#[derive(Error, Debug)]
pub enum FilterError {
    /// A work, buffer or argument was unusable
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The stage is not in a state that accepts the call
    #[error("Filter {filter} is in state {state:?}")]
    BadState { filter: FilterId, state: FilterState },

    /// The allocator kept signalling TryAgain until the stage gave up
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A control-plane rendezvous exceeded its budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Chain construction or wiring failed
    #[error("Construction failure: {0}")]
    Construction(String),

    /// The hardware engine rejected a request
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<FilterError>,
    },
}

impl FilterError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        FilterError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Compact classification, looking through any context wrappers
    pub fn kind(&self) -> ErrorKind {
        match self {
            FilterError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            FilterError::BadState { .. } => ErrorKind::BadState,
            FilterError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            FilterError::Timeout(_) => ErrorKind::Timeout,
            FilterError::Construction(_) => ErrorKind::Construction,
            FilterError::Hardware(_) => ErrorKind::Hardware,
            FilterError::Config(_) | FilterError::Io(_) => ErrorKind::Config,
            FilterError::Channel(_) => ErrorKind::Channel,
            FilterError::WithContext { source, .. } => source.kind(),
        }
    }
}

/// Copyable error classification carried by failed works
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidParameter,
    BadState,
    ResourceExhausted,
    Timeout,
    Construction,
    Hardware,
    Config,
    Channel,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidParameter => "invalid parameter",
            ErrorKind::BadState => "bad state",
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Construction => "construction failure",
            ErrorKind::Hardware => "hardware",
            ErrorKind::Config => "configuration",
            ErrorKind::Channel => "channel",
        };
        f.write_str(name)
    }
}

/// Result type alias for filter chain operations
pub type Result<T> = std::result::Result<T, FilterError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
