//! Checkpoint records, reconciliation against a live model, and slot persistence.
//!
//! A checkpoint stores the epoch to run next, the model parameters, the
//! optimizer state (possibly empty) and the best score reached so far. Three
//! slots are kept: `latest` (every epoch), a retained `history` snapshot every
//! `track_intvl` epochs, and `best`, a byte copy of `latest` taken whenever the
//! validation score improves.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, Result};
use crate::paths::{CheckpointSlot, PathResolver};
use crate::persistence::{atomic_copy, atomic_write_json};
use crate::task::Stateful;

/// Parameter name → tensor payload.
pub type StateDict = BTreeMap<String, TensorPayload>;

/// Serialized optimizer state. Empty when the run does not save it.
pub type OptimizerState = serde_json::Map<String, serde_json::Value>;

/// Dense `f32` tensor in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorPayload {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorPayload {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    fn check(&self, name: &str) -> std::result::Result<(), CheckpointError> {
        if self.numel() != self.data.len() {
            return Err(CheckpointError::MalformedTensor {
                name: name.to_string(),
                shape: self.shape.clone(),
                expected: self.numel(),
                actual: self.data.len(),
            });
        }
        Ok(())
    }
}

/// Best validation score and the epoch that reached it.
///
/// Older checkpoints store a bare number; newer ones store `[score, epoch]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BestScore {
    Tracked(f64, usize),
    Legacy(f64),
}

impl BestScore {
    /// Resolve to `(score, epoch)`; a bare score is attributed to `checkpoint_epoch`.
    pub fn resolve(self, checkpoint_epoch: usize) -> (f64, usize) {
        match self {
            BestScore::Tracked(score, epoch) => (score, epoch),
            BestScore::Legacy(score) => (score, checkpoint_epoch),
        }
    }
}

/// A persisted snapshot of training progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// The next epoch to run.
    #[serde(default)]
    pub epoch: usize,
    pub state_dict: StateDict,
    #[serde(default)]
    pub optimizer: OptimizerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_acc: Option<BestScore>,
}

impl CheckpointRecord {
    /// Epoch that produced this checkpoint (0 for fresh or legacy files).
    pub fn checkpoint_epoch(&self) -> usize {
        self.epoch.saturating_sub(1)
    }

    /// Best `(score, epoch)`, defaulting to `(0.0, checkpoint_epoch)`.
    pub fn best(&self) -> (f64, usize) {
        let ckp_epoch = self.checkpoint_epoch();
        self.max_acc
            .unwrap_or(BestScore::Legacy(0.0))
            .resolve(ckp_epoch)
    }

    /// Decode a checkpoint file body.
    ///
    /// Files without a `state_dict` key are bare parameter maps.
    pub fn decode(bytes: &[u8], path: &Path) -> std::result::Result<Self, CheckpointError> {
        let corrupt = |reason: String| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
        let is_wrapped = value
            .as_object()
            .is_some_and(|obj| obj.contains_key("state_dict"));
        let record = if is_wrapped {
            serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?
        } else {
            let state_dict: StateDict =
                serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
            CheckpointRecord {
                epoch: 0,
                state_dict,
                optimizer: OptimizerState::new(),
                max_acc: None,
            }
        };
        for (name, payload) in &record.state_dict {
            payload.check(name)?;
        }
        Ok(record)
    }
}

/// Shape of every parameter in `state`.
pub fn shape_map(state: &StateDict) -> BTreeMap<String, Vec<usize>> {
    state
        .iter()
        .map(|(name, t)| (name.clone(), t.shape.clone()))
        .collect()
}

/// Outcome of matching checkpoint parameters against a live model.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Record entries whose name and shape match a live parameter.
    pub update: StateDict,
    /// Every live parameter is covered by `update`.
    pub full_match: bool,
    /// Number of live parameters.
    pub expected: usize,
    /// Record entries that were not consumed.
    pub unused: usize,
}

impl Reconciliation {
    pub fn matched(&self) -> usize {
        self.update.len()
    }

    /// Live parameters covered and every record entry consumed.
    pub fn is_exact(&self) -> bool {
        self.full_match && self.unused == 0
    }
}

/// Select the checkpoint parameters that can be loaded into a model with `live_shapes`.
pub fn reconcile(record: &StateDict, live_shapes: &BTreeMap<String, Vec<usize>>) -> Reconciliation {
    let update: StateDict = record
        .iter()
        .filter(|(name, payload)| live_shapes.get(*name).is_some_and(|s| *s == payload.shape))
        .map(|(name, payload)| (name.clone(), payload.clone()))
        .collect();
    let expected = live_shapes.len();
    Reconciliation {
        full_match: update.len() == expected,
        unused: record.len() - update.len(),
        expected,
        update,
    }
}

/// Overwrite the matching parameters of `model`; everything else keeps its value.
///
/// An empty update fails before the model is touched.
pub fn apply(update: &StateDict, model: &mut dyn Stateful) -> Result<()> {
    if update.is_empty() {
        return Err(CheckpointError::EmptyUpdate.into());
    }
    let mut state = model.state_dict()?;
    state.extend(update.iter().map(|(k, v)| (k.clone(), v.clone())));
    model.load_state_dict(&state)
}

/// Whether the checkpoint for stored epoch `epoch` goes to the history slot.
pub fn keeps_history(epoch: usize, track_interval: usize) -> bool {
    track_interval > 0 && epoch % track_interval == 0
}

/// Paths written by one [`CheckpointStore::persist`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedCheckpoint {
    pub latest: PathBuf,
    pub history: Option<PathBuf>,
    pub best: Option<PathBuf>,
}

/// Reads and writes checkpoint slots.
#[derive(Clone)]
pub struct CheckpointStore {
    paths: Arc<dyn PathResolver>,
    track_interval: usize,
}

impl CheckpointStore {
    pub fn new(paths: Arc<dyn PathResolver>, track_interval: usize) -> Self {
        Self {
            paths,
            track_interval: track_interval.max(1),
        }
    }

    pub fn track_interval(&self) -> usize {
        self.track_interval
    }

    pub fn slot_path(&self, slot: CheckpointSlot) -> PathBuf {
        self.paths.checkpoint_path(slot)
    }

    /// Read the checkpoint at `path`.
    pub fn load(path: &Path) -> std::result::Result<CheckpointRecord, CheckpointError> {
        if !path.is_file() {
            return Err(CheckpointError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let bytes = std::fs::read(path).map_err(|_| CheckpointError::NotFound {
            path: path.to_path_buf(),
        })?;
        CheckpointRecord::decode(&bytes, path)
    }

    /// Write `record` to a single slot.
    ///
    /// The best slot duplicates the latest file when one exists.
    pub fn save(&self, record: &CheckpointRecord, slot: CheckpointSlot) -> Result<PathBuf> {
        let path = self.paths.checkpoint_path(slot);
        match slot {
            CheckpointSlot::Best => {
                let latest = self.paths.checkpoint_path(CheckpointSlot::Latest);
                if latest.is_file() {
                    atomic_copy(&latest, &path)?;
                } else {
                    atomic_write_json(&path, record)?;
                }
            }
            CheckpointSlot::Latest | CheckpointSlot::History(_) => {
                atomic_write_json(&path, record)?;
            }
        }
        Ok(path)
    }

    /// Per-epoch persistence: history (on interval), latest, and best (on improvement).
    pub fn persist(&self, record: &CheckpointRecord, is_best: bool) -> Result<SavedCheckpoint> {
        let history = if keeps_history(record.epoch, self.track_interval) {
            Some(self.save(record, CheckpointSlot::History(record.epoch))?)
        } else {
            None
        };
        let latest = self.save(record, CheckpointSlot::Latest)?;
        let best = if is_best {
            Some(self.save(record, CheckpointSlot::Best)?)
        } else {
            None
        };
        tracing::debug!(
            epoch = record.epoch,
            latest = %latest.display(),
            history = history.is_some(),
            best = is_best,
            "checkpoint saved"
        );
        Ok(SavedCheckpoint {
            latest,
            history,
            best,
        })
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("latest", &self.paths.checkpoint_path(CheckpointSlot::Latest))
            .field("track_interval", &self.track_interval)
            .finish()
    }
}
