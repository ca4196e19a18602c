//! # cdtrain ML
//!
//! Change-detection components for the cdtrain harness, built on candle:
//! siamese and early-fusion networks, the NLL criterion, SGD/Adam optimizers
//! with checkpointable state, PNG and synthetic data sources, and
//! [`ChangeDetectionTask`], which plugs all of them into the core epoch loop.

pub mod criterion;
pub mod data;
pub mod error;
pub mod factories;
pub mod models;
pub mod network;
pub mod optim;
pub mod task;
pub mod tensor;

pub use criterion::NllLoss;
pub use data::{DataLoader, DataSource, FolderDataset, Sample, SyntheticDataset};
pub use error::MlError;
pub use factories::{Split, build_task, critn_factory, data_factory, model_factory, optim_factory};
pub use network::Network;
pub use optim::{Adam, AnyOptimizer, Sgd};
pub use task::ChangeDetectionTask;
pub use tensor::open_device;
