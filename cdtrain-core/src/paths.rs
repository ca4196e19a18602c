//! Experiment path resolution.
//!
//! The controller never builds paths itself; it asks an injected [`PathResolver`].
//! [`ExperimentLayout`] is the on-disk layout used by the CLI:
//!
//! ```text
//! <exp_dir>/<tag>/weights/checkpoint_latest.json
//! <exp_dir>/<tag>/weights/checkpoint_010.json
//! <exp_dir>/<tag>/weights/model_best.json
//! <exp_dir>/<tag>/out/epoch_10/<out_dir>/<sample>.png
//! <exp_dir>/<tag>/logs/
//! ```

use std::io;
use std::path::{Path, PathBuf};

use crate::config::RunConfig;

pub const CKP_LATEST: &str = "checkpoint_latest.json";
pub const CKP_BEST: &str = "model_best.json";

/// File name of the history checkpoint for `epoch`.
pub fn counted_checkpoint_name(epoch: usize) -> String {
    format!("checkpoint_{epoch:03}.json")
}

/// The three logical checkpoint slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointSlot {
    /// Overwritten after every epoch.
    Latest,
    /// Retained snapshot for the given stored epoch.
    History(usize),
    /// Copy of the latest checkpoint with the best validation score.
    Best,
}

/// Resolves where run artifacts live.
pub trait PathResolver: Send + Sync {
    fn checkpoint_path(&self, slot: CheckpointSlot) -> PathBuf;

    /// Path for a result image of `epoch`, with parent directories created.
    fn output_path(&self, epoch: usize, file_name: &str) -> io::Result<PathBuf>;

    fn log_dir(&self) -> PathBuf;
}

/// Directory layout rooted at `<exp_dir>/<tag>`.
#[derive(Debug, Clone)]
pub struct ExperimentLayout {
    root: PathBuf,
    suffix: String,
    out_dir: String,
    suffix_off: bool,
}

impl ExperimentLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            suffix: String::new(),
            out_dir: String::new(),
            suffix_off: false,
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        let root = if config.tag.is_empty() {
            config.exp_dir.clone()
        } else {
            config.exp_dir.join(&config.tag)
        };
        Self {
            root,
            suffix: config.suffix.clone(),
            out_dir: config.out_dir.clone(),
            suffix_off: config.suffix_off,
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn with_out_dir(mut self, out_dir: impl Into<String>) -> Self {
        self.out_dir = out_dir.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn weights_dir(&self) -> PathBuf {
        self.root.join("weights")
    }

    /// Insert `_<suffix>` before the extension of `name`.
    fn attach_suffix(&self, name: &str) -> String {
        if self.suffix.is_empty() {
            return name.to_string();
        }
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{}.{ext}", self.suffix),
            _ => format!("{name}_{}", self.suffix),
        }
    }
}

impl PathResolver for ExperimentLayout {
    fn checkpoint_path(&self, slot: CheckpointSlot) -> PathBuf {
        let name = match slot {
            CheckpointSlot::Latest => CKP_LATEST.to_string(),
            CheckpointSlot::History(epoch) => counted_checkpoint_name(epoch),
            CheckpointSlot::Best => CKP_BEST.to_string(),
        };
        self.weights_dir().join(self.attach_suffix(&name))
    }

    fn output_path(&self, epoch: usize, file_name: &str) -> io::Result<PathBuf> {
        let mut dir = self.root.join("out").join(format!("epoch_{epoch}"));
        if !self.out_dir.is_empty() {
            dir = dir.join(&self.out_dir);
        }
        std::fs::create_dir_all(&dir)?;
        let name = if self.suffix_off {
            file_name.to_string()
        } else {
            self.attach_suffix(file_name)
        };
        Ok(dir.join(name))
    }

    fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_checkpoint_slot_names() {
        let layout = ExperimentLayout::new("/exp/run");
        assert_eq!(
            layout.checkpoint_path(CheckpointSlot::Latest),
            PathBuf::from("/exp/run/weights/checkpoint_latest.json")
        );
        assert_eq!(
            layout.checkpoint_path(CheckpointSlot::History(5)),
            PathBuf::from("/exp/run/weights/checkpoint_005.json")
        );
        assert_eq!(
            layout.checkpoint_path(CheckpointSlot::Best),
            PathBuf::from("/exp/run/weights/model_best.json")
        );
    }

    #[test]
    fn test_suffix_is_attached_before_extension() {
        let layout = ExperimentLayout::new("/exp").with_suffix("lr1e-3");
        assert_eq!(
            layout.checkpoint_path(CheckpointSlot::Best),
            PathBuf::from("/exp/weights/model_best_lr1e-3.json")
        );
    }

    #[test]
    fn test_output_path_is_namespaced_by_epoch() {
        let dir = TempDir::new().unwrap();
        let layout = ExperimentLayout::new(dir.path())
            .with_suffix("v2")
            .with_out_dir("maps");
        let path = layout.output_path(3, "tile_07.png").unwrap();
        assert_eq!(
            path,
            dir.path().join("out").join("epoch_3").join("maps").join("tile_07_v2.png")
        );
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn test_suffix_off_keeps_output_names() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig {
            exp_dir: dir.path().to_path_buf(),
            tag: "levir".into(),
            suffix: "v2".into(),
            suffix_off: true,
            ..Default::default()
        };
        let layout = ExperimentLayout::from_config(&config);
        let path = layout.output_path(0, "a.png").unwrap();
        assert_eq!(path, dir.path().join("levir").join("out").join("epoch_0").join("a.png"));
        assert_eq!(layout.log_dir(), dir.path().join("levir").join("logs"));
    }
}
