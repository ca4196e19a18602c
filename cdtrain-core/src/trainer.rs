//! Epoch loop controller.
//!
//! [`Trainer`] drives a [`Task`] through a run: optional resume from a
//! checkpoint, then for every epoch learning-rate adjustment, a training pass,
//! a validation pass, best-score tracking, and checkpoint persistence. In
//! evaluation mode it restores a checkpoint and performs a single validation
//! pass.

use std::sync::Arc;

use crate::checkpoint::{
    BestScore, CheckpointRecord, CheckpointStore, OptimizerState, SavedCheckpoint, apply, reconcile,
};
use crate::config::RunConfig;
use crate::error::{CheckpointError, ConfigError, Result};
use crate::logging::RunLogger;
use crate::paths::PathResolver;
use crate::scheduler::{LrPolicy, apply_learning_rate};
use crate::task::{EpochEnv, Task};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
}

/// Progress counters restored from, and written to, checkpoints.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingState {
    /// Next epoch to run.
    pub start_epoch: usize,
    pub best_score: f64,
    pub best_epoch: usize,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            start_epoch: 0,
            best_score: 0.0,
            best_epoch: 0,
        }
    }
}

impl TrainingState {
    /// Epoch that produced the restored checkpoint; 0 when nothing was restored.
    pub fn checkpoint_epoch(&self) -> usize {
        self.start_epoch.saturating_sub(1)
    }
}

/// Result of [`Trainer::run`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunOutcome {
    Trained(TrainingState),
    /// Validation score, or `None` when no checkpoint was assigned.
    Evaluated(Option<f64>),
}

/// Drives a task through training or evaluation.
pub struct Trainer<T: Task> {
    config: RunConfig,
    task: T,
    logger: Arc<dyn RunLogger>,
    paths: Arc<dyn PathResolver>,
    store: CheckpointStore,
    policy: LrPolicy,
    state: TrainingState,
    status: RunStatus,
}

impl<T: Task> Trainer<T> {
    /// Take a snapshot of `config` and wire the collaborators together.
    ///
    /// Fails on an invalid configuration (e.g. an unknown lr mode when
    /// training) before anything runs. Evaluation never adjusts the rate, so
    /// its policy is not parsed.
    pub fn new(
        config: &RunConfig,
        task: T,
        logger: Arc<dyn RunLogger>,
        paths: Arc<dyn PathResolver>,
    ) -> Result<Self> {
        let config = config.clone();
        config.validate()?;
        let policy = if config.is_training() {
            LrPolicy::from_config(&config)?
        } else {
            LrPolicy::Const
        };

        for (key, value) in config.sorted_entries() {
            logger.show(&format!("{key}: {value}"));
        }

        let store = CheckpointStore::new(Arc::clone(&paths), config.track_intvl);
        Ok(Self {
            config,
            task,
            logger,
            paths,
            store,
            policy,
            state: TrainingState::default(),
            status: RunStatus::NotStarted,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn is_training(&self) -> bool {
        self.config.is_training()
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    pub fn into_task(self) -> T {
        self.task
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Train or evaluate depending on the configured command.
    pub fn run(&mut self) -> Result<RunOutcome> {
        if self.is_training() {
            self.train().map(RunOutcome::Trained)
        } else {
            self.evaluate().map(RunOutcome::Evaluated)
        }
    }

    /// Run every remaining epoch. Returns the final progress counters.
    pub fn train(&mut self) -> Result<TrainingState> {
        if !self.is_training() {
            return Err(ConfigError::invalid("cmd", "training requires cmd = train").into());
        }
        if self.task.optimizer().is_none() {
            return Err(ConfigError::invalid("optimizer", "training requires an optimizer").into());
        }

        self.status = RunStatus::Running;
        let result = self.train_epochs();
        self.status = match result {
            Ok(_) => RunStatus::Completed,
            Err(_) => RunStatus::Failed,
        };
        result
    }

    fn train_epochs(&mut self) -> Result<TrainingState> {
        if self.config.resume_path().is_some() {
            self.resume_from_checkpoint()?;
        }

        let mut max_acc = self.state.best_score;
        let mut best_epoch = self.state.best_epoch;
        let store_outputs = self.config.store_outputs();

        for epoch in self.state.start_epoch..self.config.num_epochs {
            let _span = tracing::info_span!("epoch", epoch).entered();

            let lr = self.adjust_learning_rate(epoch);
            self.logger
                .show_nl(&format!("Epoch: [{epoch}]\tlr {lr:.06}"));

            let env = EpochEnv {
                config: &self.config,
                logger: self.logger.as_ref(),
                paths: self.paths.as_ref(),
            };
            self.task.train_epoch(epoch, &env)?;

            // Clear the history of metric objects
            self.task.metrics_mut().reset();

            self.logger.show_nl("Validate");
            let acc = self.task.validate_epoch(epoch, store_outputs, &env)?;

            let is_best = acc > max_acc;
            if is_best {
                max_acc = acc;
                best_epoch = epoch;
            }
            self.logger.show_nl(&format!(
                "Current: {acc:.6} ({epoch:03})\tBest: {max_acc:.6} ({best_epoch:03})\t"
            ));

            // The checkpoint stores the next epoch
            self.save_checkpoint(max_acc, best_epoch, epoch + 1, is_best)?;
            self.state = TrainingState {
                start_epoch: epoch + 1,
                best_score: max_acc,
                best_epoch,
            };
        }

        Ok(self.state)
    }

    /// Restore a checkpoint and run one full validation pass.
    ///
    /// Returns `Ok(None)` (with a warning) when no checkpoint is assigned.
    pub fn evaluate(&mut self) -> Result<Option<f64>> {
        if self.config.resume_path().is_none() {
            self.logger.warning("Warning: no checkpoint assigned!");
            return Ok(None);
        }

        self.status = RunStatus::Running;
        let result = self.evaluate_checkpoint();
        self.status = match result {
            Ok(_) => RunStatus::Completed,
            Err(_) => RunStatus::Failed,
        };
        result.map(Some)
    }

    fn evaluate_checkpoint(&mut self) -> Result<f64> {
        self.resume_from_checkpoint()?;

        let epoch = self.state.checkpoint_epoch();
        self.task.metrics_mut().reset();
        let env = EpochEnv {
            config: &self.config,
            logger: self.logger.as_ref(),
            paths: self.paths.as_ref(),
        };
        let score = self
            .task
            .validate_epoch(epoch, self.config.store_outputs(), &env)?;
        self.logger
            .show_nl(&format!("Score: {score:.6} (checkpoint epoch {epoch:03})"));
        Ok(score)
    }

    /// Compute the learning rate for `epoch` and push it into the optimizer.
    pub fn adjust_learning_rate(&mut self, epoch: usize) -> f64 {
        let lr = self.policy.rate(epoch, self.config.lr);
        if let Some(optimizer) = self.task.optimizer_mut() {
            apply_learning_rate(optimizer, lr);
        }
        lr
    }

    /// Load the configured checkpoint into the live model.
    ///
    /// Partial loads are accepted while training as long as at least one
    /// parameter matches; evaluation requires every live parameter. Progress
    /// counters and optimizer state are restored only from a checkpoint that
    /// matches the model exactly (or covers it, when evaluating), and only
    /// after the weights were loaded.
    pub fn resume_from_checkpoint(&mut self) -> Result<()> {
        let Some(path) = self.config.resume_path() else {
            return Err(ConfigError::invalid("resume", "no checkpoint assigned").into());
        };
        let training = self.is_training();

        if !path.is_file() {
            self.logger.error(&format!(
                "=> No checkpoint was found at '{}'.",
                path.display()
            ));
            return Err(CheckpointError::NotFound { path }.into());
        }

        self.logger
            .show(&format!("=> Loading checkpoint '{}'", path.display()));
        let record = match CheckpointStore::load(&path) {
            Ok(record) => record,
            Err(err) => {
                self.logger.error(&format!("=> {err}"));
                return Err(err.into());
            }
        };

        let live_shapes = self.task.model().parameter_shapes()?;
        let rec = reconcile(&record.state_dict, &live_shapes);

        let restore = if !training {
            if !rec.full_match {
                self.logger.error("=> Mismatched checkpoint for evaluation");
                return Err(CheckpointError::Mismatch {
                    path,
                    matched: rec.matched(),
                    expected: rec.expected,
                }
                .into());
            }
            if rec.unused > 0 {
                self.logger.warning(&format!(
                    "=> {} checkpoint entries are not used by the model.",
                    rec.unused
                ));
            }
            true
        } else if !rec.is_exact() {
            self.logger
                .warning("Warning: trying to load an mismatched checkpoint.");
            if rec.update.is_empty() {
                self.logger.error("=> No parameter is to be loaded.");
                return Err(CheckpointError::NothingToLoad { path }.into());
            }
            self.logger.warning(&format!(
                "=> {} params are to be loaded.",
                rec.matched()
            ));
            false
        } else {
            !self.config.anew
        };

        apply(&rec.update, self.task.model_mut())?;
        if restore {
            self.restore_progress(&record)?;
        }

        self.logger.show(&format!(
            "=> Loaded checkpoint '{}' (epoch {}, max_acc {:.4} at epoch {})",
            path.display(),
            self.state.checkpoint_epoch(),
            self.state.best_score,
            self.state.best_epoch
        ));
        Ok(())
    }

    fn restore_progress(&mut self, record: &CheckpointRecord) -> Result<()> {
        let (best_score, best_epoch) = record.best();
        let restored = TrainingState {
            start_epoch: record.epoch,
            best_score,
            best_epoch,
        };

        if self.config.load_optim && self.is_training() {
            if record.optimizer.is_empty() {
                self.logger
                    .warning("=> Checkpoint carries no optimizer state; keeping a fresh optimizer.");
            } else if let Some(optimizer) = self.task.optimizer_mut() {
                // Note that weight decay may change here
                optimizer.load_state_dict(&record.optimizer)?;
            }
        }
        self.state = restored;
        Ok(())
    }

    /// Persist the current model as the checkpoint for stored epoch `epoch`.
    pub fn save_checkpoint(
        &self,
        max_acc: f64,
        best_epoch: usize,
        epoch: usize,
        is_best: bool,
    ) -> Result<SavedCheckpoint> {
        let optimizer = match self.task.optimizer() {
            Some(opt) if self.config.save_optim => opt.state_dict()?,
            _ => OptimizerState::new(),
        };
        let record = CheckpointRecord {
            epoch,
            state_dict: self.task.model().state_dict()?,
            optimizer,
            max_acc: Some(BestScore::Tracked(max_acc, best_epoch)),
        };
        self.store.persist(&record, is_best)
    }
}
