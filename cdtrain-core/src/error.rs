//! Error types for the cdtrain harness.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering configuration, checkpoint persistence, and task collaborators.

use std::path::PathBuf;

/// Top-level error type for the cdtrain core library.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Failure raised by a task collaborator (model, optimizer, data source).
    #[error("Component error: {0}")]
    Component(Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TrainError {
    pub fn component(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Component(Box::new(err))
    }
}

/// Errors in the run configuration. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown lr mode '{mode}' (expected step, poly or const)")]
    UnknownLrMode { mode: String },

    #[error("unknown {kind} '{name}'")]
    UnknownComponent { kind: String, name: String },

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("unknown command '{cmd}' (expected train or val)")]
    UnknownCommand { cmd: String },

    #[error("failed to load configuration: {message}")]
    Load { message: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn unknown_component(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::UnknownComponent {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Errors from checkpoint loading, reconciliation, and persistence.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("no checkpoint was found at '{}'", path.display())]
    NotFound { path: PathBuf },

    #[error(
        "mismatched checkpoint '{}': {matched} of {expected} parameters match",
        path.display()
    )]
    Mismatch {
        path: PathBuf,
        matched: usize,
        expected: usize,
    },

    #[error("no parameter is to be loaded from '{}'", path.display())]
    NothingToLoad { path: PathBuf },

    #[error("the update set is empty; nothing to apply")]
    EmptyUpdate,

    #[error("failed to decode checkpoint '{}': {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("parameter '{name}' has {actual} values but shape {shape:?} needs {expected}")]
    MalformedTensor {
        name: String,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
}

/// Convenience result type for cdtrain core operations.
pub type Result<T> = std::result::Result<T, TrainError>;
