//! Error types for the threshold mesh.
//!
//! Validation errors are rejected synchronously and never retried. Remote errors are
//! caught at the flow boundary and turned into a local fallback. Storage errors are the
//! one class that reaches callers: a failing store undermines offline resilience and
//! must be visible.

use thiserror::Error;

/// Result type alias for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur inside the mesh
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("offline store used before init()")]
    NotInitialized,

    #[error("unknown cell: {0}")]
    UnknownCell(String),

    #[error("token rejected for cell {0}")]
    InvalidToken(String),

    #[error("no route table for threshold {0}")]
    UnknownRoute(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl MeshError {
    /// True for validation failures (bad token, unknown cell, malformed input).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::NotInitialized
                | Self::UnknownCell(_)
                | Self::InvalidToken(_)
                | Self::UnknownRoute(_)
                | Self::NotFound(_)
                | Self::InvalidInput(_)
        )
    }

    /// True for failures that a local fallback is expected to absorb.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl From<reqwest::Error> for MeshError {
    fn from(err: reqwest::Error) -> Self {
        MeshError::Remote(err.to_string())
    }
}
