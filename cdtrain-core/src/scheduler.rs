//! Learning-rate schedules.

use crate::config::RunConfig;
use crate::error::ConfigError;
use crate::task::Optimizer;

/// Exponent of the polynomial decay.
pub const POLY_POWER: f64 = 1.1;

/// How the learning rate evolves over epochs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LrPolicy {
    /// Halve the rate every `step_size` epochs.
    Step { step_size: usize },
    /// Decay towards zero over `total_epochs`.
    Poly { total_epochs: usize },
    /// Keep the base rate.
    Const,
}

impl LrPolicy {
    /// Parse a policy name together with its parameters.
    pub fn parse(mode: &str, step_size: usize, total_epochs: usize) -> Result<Self, ConfigError> {
        match mode {
            "step" => {
                if step_size == 0 {
                    return Err(ConfigError::invalid("step", "must be at least 1"));
                }
                Ok(LrPolicy::Step { step_size })
            }
            "poly" => Ok(LrPolicy::Poly { total_epochs }),
            "const" => Ok(LrPolicy::Const),
            other => Err(ConfigError::UnknownLrMode {
                mode: other.to_string(),
            }),
        }
    }

    pub fn from_config(config: &RunConfig) -> Result<Self, ConfigError> {
        Self::parse(&config.lr_mode, config.step, config.num_epochs)
    }

    /// Learning rate for `epoch` given the base rate.
    pub fn rate(&self, epoch: usize, base_lr: f64) -> f64 {
        match *self {
            LrPolicy::Step { step_size } => base_lr * 0.5f64.powi((epoch / step_size) as i32),
            LrPolicy::Poly { total_epochs } => {
                if total_epochs == 0 {
                    return base_lr;
                }
                let progress = epoch as f64 / total_epochs as f64;
                base_lr * (1.0 - progress).max(0.0).powf(POLY_POWER)
            }
            LrPolicy::Const => base_lr,
        }
    }
}

/// Learning rate for `epoch` under the named policy.
pub fn learning_rate(
    epoch: usize,
    base_lr: f64,
    mode: &str,
    step_size: usize,
    total_epochs: usize,
) -> Result<f64, ConfigError> {
    Ok(LrPolicy::parse(mode, step_size, total_epochs)?.rate(epoch, base_lr))
}

/// Write `lr` into every parameter group of `optimizer`.
pub fn apply_learning_rate(optimizer: &mut dyn Optimizer, lr: f64) {
    for group in optimizer.param_groups_mut() {
        group.lr = lr;
    }
}
