//! # cdtrain Core
//!
//! Framework-agnostic training harness for supervised image-to-image models.
//! Provides the run configuration, checkpoint store, learning-rate scheduler,
//! metric accumulators, and the epoch loop controller. Concrete tasks plug in
//! through the [`Task`] capability interface.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod paths;
pub mod persistence;
pub mod scheduler;
pub mod task;
pub mod trainer;

// Re-export commonly used types at the crate root.
pub use checkpoint::{
    BestScore, CheckpointRecord, CheckpointStore, OptimizerState, Reconciliation, StateDict,
    TensorPayload, reconcile,
};
pub use config::{Command, DeviceSpec, RunConfig, load_config};
pub use error::{CheckpointError, ConfigError, Result, TrainError};
pub use logging::{MemoryLogger, RunLogger, TracingLogger, make_desc};
pub use metrics::{AverageMeter, Metric, MetricSet, metric_factory};
pub use paths::{CheckpointSlot, ExperimentLayout, PathResolver};
pub use scheduler::{LrPolicy, learning_rate};
pub use task::{EpochEnv, Optimizer, ParamGroup, Stateful, Task};
pub use trainer::{RunOutcome, RunStatus, Trainer, TrainingState};
