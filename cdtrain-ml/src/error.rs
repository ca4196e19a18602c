//! Error types for the cdtrain-ml crate.

use cdtrain_core::{ConfigError, TrainError};
use thiserror::Error;

/// Top-level error type for networks, optimizers and data sources.
#[derive(Debug, Error)]
pub enum MlError {
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Optimizer error: {0}")]
    Optimizer(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl MlError {
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn optimizer(msg: impl Into<String>) -> Self {
        Self::Optimizer(msg.into())
    }
}

impl From<MlError> for TrainError {
    fn from(err: MlError) -> Self {
        match err {
            MlError::Config(e) => TrainError::Config(e),
            MlError::Io(e) => TrainError::Io(e),
            MlError::Serde(e) => TrainError::Serialization(e),
            other => TrainError::component(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, MlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_keep_their_kind() {
        let err: TrainError = MlError::from(ConfigError::unknown_component("model", "unet")).into();
        assert!(matches!(err, TrainError::Config(ConfigError::UnknownComponent { .. })));
    }

    #[test]
    fn test_other_errors_become_component_failures() {
        let err: TrainError = MlError::dataset("empty split").into();
        assert!(matches!(err, TrainError::Component(_)));
        assert!(err.to_string().contains("empty split"));
    }
}
