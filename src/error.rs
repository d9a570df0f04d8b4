use std::fmt::Display;
use std::path::PathBuf;

/// A specialized error type for probe persistence operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Another instrumented queue already owns the log at this path.
    #[error("path already registered: {0}")]
    PathConflict(PathBuf),
    /// Recovery could not locate a valid record boundary, or a format
    /// marker did not match.
    #[error("data corruption: {0}")]
    Corruption(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// A mapped-region access fell outside the current window.
    #[error("region access out of bounds: offset {offset} len {len} capacity {capacity}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
}

impl ProbeError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a corruption error from a displayable value.
    pub fn corruption<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Corruption(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }
}

/// A Result type alias for probe persistence operations.
pub type ProbeResult<T> = Result<T, ProbeError>;
