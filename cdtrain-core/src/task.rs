//! Capability interfaces between the epoch loop and a concrete task.
//!
//! The controller only needs to read and restore model parameters, adjust and
//! persist optimizer state, reset metrics, and run one training or validation
//! epoch. Everything tensor-specific stays behind these traits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::checkpoint::{OptimizerState, StateDict, shape_map};
use crate::config::RunConfig;
use crate::error::Result;
use crate::logging::RunLogger;
use crate::metrics::MetricSet;
use crate::paths::PathResolver;

/// A component whose parameters can be captured and restored by name.
pub trait Stateful {
    fn state_dict(&self) -> Result<StateDict>;

    /// Replace parameters with the entries of `state`.
    ///
    /// Implementations must reject names they do not own and shapes that differ
    /// from the live parameter.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;

    fn parameter_shapes(&self) -> Result<BTreeMap<String, Vec<usize>>> {
        Ok(shape_map(&self.state_dict()?))
    }
}

/// Hyper-parameters shared by a group of optimized parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub lr: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub momentum: f64,
}

impl ParamGroup {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            weight_decay: 0.0,
            momentum: 0.0,
        }
    }
}

/// Optimizer surface used by the controller.
pub trait Optimizer {
    fn param_groups(&self) -> &[ParamGroup];

    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    fn state_dict(&self) -> Result<OptimizerState>;

    /// Restore state produced by [`Optimizer::state_dict`]. Param-group
    /// hyper-parameters (including weight decay) are replaced as well.
    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()>;
}

/// Everything a task may consult while running an epoch.
pub struct EpochEnv<'a> {
    pub config: &'a RunConfig,
    pub logger: &'a dyn RunLogger,
    pub paths: &'a dyn PathResolver,
}

impl EpochEnv<'_> {
    pub fn is_training(&self) -> bool {
        self.config.is_training()
    }
}

/// A trainable task variant (e.g. binary change detection).
pub trait Task {
    fn model(&self) -> &dyn Stateful;

    fn model_mut(&mut self) -> &mut dyn Stateful;

    /// `None` for evaluation-only runs.
    fn optimizer(&self) -> Option<&dyn Optimizer>;

    fn optimizer_mut(&mut self) -> Option<&mut dyn Optimizer>;

    fn metrics_mut(&mut self) -> &mut MetricSet;

    /// One full pass over the training source.
    fn train_epoch(&mut self, epoch: usize, env: &EpochEnv<'_>) -> Result<()>;

    /// One validation pass. Returns the score used for best-model selection.
    fn validate_epoch(&mut self, epoch: usize, store: bool, env: &EpochEnv<'_>) -> Result<f64>;
}
