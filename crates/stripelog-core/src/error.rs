//! Error types shared by the stripelog crates.

use thiserror::Error;

/// A specialized `Result` type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading configuration or describing RAID geometry.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The RAID geometry cannot host a write journal.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates a new geometry error.
    #[must_use]
    pub fn geometry(message: impl Into<String>) -> Self {
        Self::InvalidGeometry(message.into())
    }

    /// Returns true if this error came from configuration parsing or validation.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
