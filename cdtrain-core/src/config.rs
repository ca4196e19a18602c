//! Run configuration for cdtrain.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! The resulting [`RunConfig`] is an immutable snapshot: the controller keeps its own copy and
//! hands out shared references only.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Environment variable prefix (`CDTRAIN_BATCH_SIZE`, `CDTRAIN_LR`, ...).
pub const ENV_PREFIX: &str = "CDTRAIN_";

/// Which operation the run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Train,
    Val,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Train => "train",
            Command::Val => "val",
        }
    }
}

impl std::str::FromStr for Command {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Command::Train),
            "val" => Ok(Command::Val),
            other => Err(ConfigError::UnknownCommand {
                cmd: other.to_string(),
            }),
        }
    }
}

/// Compute device requested by the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
}

impl std::str::FromStr for DeviceSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(DeviceSpec::Cpu);
        }
        if s == "cuda" {
            return Ok(DeviceSpec::Cuda(0));
        }
        if let Some(ordinal) = s.strip_prefix("cuda:") {
            return ordinal
                .parse()
                .map(DeviceSpec::Cuda)
                .map_err(|_| ConfigError::invalid("device", format!("bad cuda ordinal '{ordinal}'")));
        }
        Err(ConfigError::invalid(
            "device",
            format!("'{s}' is not one of cpu, cuda, cuda:<n>"),
        ))
    }
}

/// All parameters of a training or evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// `train` or `val`.
    pub cmd: Command,
    /// Data source name passed to the data factory.
    pub dataset: String,
    /// Root directory of on-disk datasets.
    pub data_dir: PathBuf,
    /// Network architecture name.
    pub model: String,
    /// Loss function name.
    pub criterion: String,
    /// Optimizer name.
    pub optimizer: String,
    pub batch_size: usize,
    pub num_epochs: usize,
    /// Base learning rate.
    pub lr: f64,
    /// Learning-rate policy: `step`, `poly` or `const`.
    pub lr_mode: String,
    /// Step size (in epochs) of the `step` policy.
    pub step: usize,
    pub weight_decay: f64,
    pub momentum: f64,
    /// Checkpoint to resume from. Empty means none.
    pub resume: String,
    /// Discard the epoch counter and best score of a resumed checkpoint.
    pub anew: bool,
    /// Restore optimizer state when resuming a training run.
    pub load_optim: bool,
    /// Store optimizer state in checkpoints.
    pub save_optim: bool,
    /// Write predicted change maps during validation.
    pub save_on: bool,
    /// Sub-directory for predicted change maps. A non-empty value also enables saving.
    pub out_dir: String,
    /// Do not append the experiment suffix to output image paths.
    pub suffix_off: bool,
    /// Keep a history checkpoint every `track_intvl` epochs.
    pub track_intvl: usize,
    pub device: String,
    /// Metric names; the first one drives best-model selection.
    pub metrics: Vec<String>,
    /// Root directory of experiment artifacts.
    pub exp_dir: PathBuf,
    pub tag: String,
    pub suffix: String,
    pub seed: u64,
    /// Center-crop side length for samples. Zero disables cropping.
    pub crop_size: usize,
    /// Passes over the training source per epoch.
    pub repeats: usize,
    /// Validation batches per epoch while training.
    pub val_iters: usize,
    /// Disable the JSON log file.
    pub log_off: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cmd: Command::Train,
            dataset: "synthetic".to_string(),
            data_dir: PathBuf::from("data"),
            model: "siamdiff".to_string(),
            criterion: "NLL".to_string(),
            optimizer: "Adam".to_string(),
            batch_size: 8,
            num_epochs: 200,
            lr: 1e-4,
            lr_mode: "const".to_string(),
            step: 200,
            weight_decay: 1e-4,
            momentum: 0.9,
            resume: String::new(),
            anew: false,
            load_optim: false,
            save_optim: false,
            save_on: false,
            out_dir: String::new(),
            suffix_off: false,
            track_intvl: 1,
            device: "cpu".to_string(),
            metrics: vec![
                "F1Score".to_string(),
                "Precision".to_string(),
                "Recall".to_string(),
                "OA".to_string(),
            ],
            exp_dir: PathBuf::from("exp"),
            tag: String::new(),
            suffix: String::new(),
            seed: 42,
            crop_size: 0,
            repeats: 1,
            val_iters: 16,
            log_off: false,
        }
    }
}

impl RunConfig {
    pub fn is_training(&self) -> bool {
        self.cmd == Command::Train
    }

    /// Checkpoint path to resume from, if one was assigned.
    pub fn resume_path(&self) -> Option<PathBuf> {
        let trimmed = self.resume.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    }

    /// Whether validation should write predicted change maps.
    pub fn store_outputs(&self) -> bool {
        self.save_on || !self.out_dir.is_empty()
    }

    pub fn device_spec(&self) -> Result<DeviceSpec, ConfigError> {
        self.device.parse()
    }

    /// Reject values the harness cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        if self.track_intvl == 0 {
            return Err(ConfigError::invalid("track_intvl", "must be at least 1"));
        }
        if self.is_training() && self.num_epochs == 0 {
            return Err(ConfigError::invalid("num_epochs", "must be at least 1"));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(ConfigError::invalid("lr", "must be a positive number"));
        }
        if self.is_training() && self.lr_mode == "step" && self.step == 0 {
            return Err(ConfigError::invalid("step", "must be at least 1 for lr_mode=step"));
        }
        if self.repeats == 0 {
            return Err(ConfigError::invalid("repeats", "must be at least 1"));
        }
        self.device_spec()?;
        Ok(())
    }

    /// Flatten the configuration into `(key, value)` pairs sorted by key.
    pub fn sorted_entries(&self) -> Vec<(String, String)> {
        let value = serde_json::to_value(self).unwrap_or_default();
        let mut entries: Vec<(String, String)> = match value {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| {
                    let shown = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, shown)
                })
                .collect(),
            _ => Vec::new(),
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Render the configuration as TOML, e.g. to archive it next to the checkpoints.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Load {
            message: e.to_string(),
        })
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument, typically CLI flags)
/// 2. Environment variables (prefixed with `CDTRAIN_`)
/// 3. The TOML file at `config_file`, when given
/// 4. Built-in defaults
pub fn load_config<O: Serialize>(
    config_file: Option<&Path>,
    overrides: &O,
) -> Result<RunConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(RunConfig::default()));

    if let Some(path) = config_file {
        if !path.is_file() {
            return Err(ConfigError::Load {
                message: format!("config file '{}' does not exist", path.display()),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
    figment = figment.merge(Serialized::defaults(overrides));

    let config: RunConfig = figment.extract().map_err(|e| ConfigError::Load {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.is_training());
        assert!(config.resume_path().is_none());
        assert!(!config.store_outputs());
    }

    #[test]
    fn test_out_dir_enables_output_storage() {
        let config = RunConfig {
            out_dir: "maps".into(),
            ..Default::default()
        };
        assert!(config.store_outputs());
    }

    #[test]
    fn test_validate_rejects_zero_track_interval() {
        let config = RunConfig {
            track_intvl: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("track_intvl"));
    }

    #[test]
    fn test_validate_rejects_step_policy_without_step() {
        let config = RunConfig {
            lr_mode: "step".into(),
            step: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cpu);
        assert_eq!("cuda".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(0));
        assert_eq!("CUDA:2".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(2));
        assert!("tpu".parse::<DeviceSpec>().is_err());
        assert!("cuda:x".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn test_load_config_layers_file_and_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(
            &path,
            "batch_size = 4\nlr = 0.01\nlr_mode = \"step\"\nstep = 10\nmetrics = [\"Recall\"]\n",
        )
        .unwrap();

        let mut overrides = BTreeMap::new();
        overrides.insert("batch_size", serde_json::json!(2));

        let config = load_config(Some(&path), &overrides).unwrap();
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.lr, 0.01);
        assert_eq!(config.lr_mode, "step");
        assert_eq!(config.metrics, vec!["Recall".to_string()]);
        assert_eq!(config.num_epochs, RunConfig::default().num_epochs);
    }

    #[test]
    fn test_load_config_reads_prefixed_environment() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CDTRAIN_VAL_ITERS", "3");
            jail.set_env("CDTRAIN_SUFFIX_OFF", "true");
            jail.set_env("CDTRAIN_SEED", "11");

            let mut overrides = BTreeMap::new();
            overrides.insert("seed", serde_json::json!(12));

            let config = load_config(None, &overrides).map_err(|e| e.to_string())?;
            assert_eq!(config.val_iters, 3);
            assert!(config.suffix_off);
            assert_eq!(config.seed, 12);
            Ok(())
        });
    }

    #[test]
    fn test_evaluation_ignores_step_policy_parameters() {
        let config = RunConfig {
            cmd: Command::Val,
            lr_mode: "step".into(),
            step: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_missing_file_fails() {
        let overrides: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
        let err = load_config(Some(Path::new("/nonexistent/run.toml")), &overrides).unwrap_err();
        assert!(matches!(err, ConfigError::Load { .. }));
    }

    #[test]
    fn test_sorted_entries_are_sorted_by_key() {
        let entries = RunConfig::default().sorted_entries();
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.clone()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(entries.iter().any(|(k, v)| k == "cmd" && v == "train"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = RunConfig {
            resume: "exp/weights/checkpoint_latest.json".into(),
            anew: true,
            ..Default::default()
        };
        let rendered = config.to_toml().unwrap();
        let parsed: RunConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
