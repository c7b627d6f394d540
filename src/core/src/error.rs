use std::sync::Arc;

use thiserror::Error;

/// kolite error types
#[derive(Error, Debug)]
pub enum KoError {
    /// Reference is not a `scheme://path` form or no builder supports it
    #[error("unsupported reference: {0}")]
    Reference(String),

    /// Reference does not name a buildable command
    #[error("import error: {0}")]
    Import(String),

    /// External compiler exited non-zero
    #[error("toolchain error: {stderr}")]
    Toolchain { stderr: String },

    /// Malformed platform or ARM variant
    #[error("platform error: {0}")]
    Platform(String),

    /// Base image has a shape we cannot build onto
    #[error("unsupported base: {0}")]
    UnsupportedBase(String),

    /// Tar assembly failed while walking a data directory
    #[error("tar error: {0}")]
    Tar(String),

    /// Layer-metadata lookup missed; recovered by rebuilding the layer
    #[error("layer metadata cache miss: {0}")]
    CacheMiss(String),

    /// Registry or daemon rejected a publish
    #[error("publish error: {0}")]
    Publish(String),

    /// Registry client failure
    #[error("registry error: {registry}: {message}")]
    Registry { registry: String, message: String },

    /// Manifest resolution error
    #[error("resolve error: {0}")]
    Resolve(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Image construction error
    #[error("image error: {0}")]
    Image(String),

    /// Context cancelled
    #[error("build cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A memoized failure observed by a concurrent awaiter
    #[error("{0}")]
    Shared(Arc<KoError>),
}

impl From<serde_json::Error> for KoError {
    fn from(err: serde_json::Error) -> Self {
        KoError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for KoError {
    fn from(err: serde_yaml::Error) -> Self {
        KoError::Serialization(err.to_string())
    }
}

impl KoError {
    /// Whether this error (or the failure it shares) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            KoError::Cancelled => true,
            KoError::Shared(inner) => inner.is_cancelled(),
            _ => false,
        }
    }
}

/// Result type alias for kolite operations
pub type Result<T> = std::result::Result<T, KoError>;
