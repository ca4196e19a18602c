//! Name-based construction of the task components from a [`RunConfig`].

use candle_core::Device;
use cdtrain_core::{ConfigError, RunConfig, metric_factory};

use crate::criterion::NllLoss;
use crate::data::{CHANNELS, DataLoader, DataSource, FolderDataset, SyntheticDataset};
use crate::error::Result;
use crate::network::Network;
use crate::optim::{Adam, AnyOptimizer, Sgd};
use crate::task::ChangeDetectionTask;
use crate::tensor::open_device;

/// Side length of synthetic samples.
pub const SYNTHETIC_SIZE: usize = 32;
pub const SYNTHETIC_TRAIN_LEN: usize = 64;
pub const SYNTHETIC_VAL_LEN: usize = 16;

/// Data split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

pub fn model_factory(name: &str, device: &Device) -> Result<Network> {
    Network::new(name, CHANNELS, device)
}

pub fn critn_factory(name: &str) -> Result<NllLoss> {
    match name.to_ascii_uppercase().as_str() {
        "NLL" | "CE" => Ok(NllLoss::new()),
        _ => Err(ConfigError::unknown_component("criterion", name).into()),
    }
}

pub fn optim_factory(name: &str, network: &Network, config: &RunConfig) -> Result<AnyOptimizer> {
    let params = network.named_vars()?;
    match name.to_ascii_lowercase().as_str() {
        "sgd" => Ok(AnyOptimizer::Sgd(Sgd::new(
            params,
            config.lr,
            config.momentum,
            config.weight_decay,
        ))),
        "adam" => Ok(AnyOptimizer::Adam(Adam::new(
            params,
            config.lr,
            config.weight_decay,
        ))),
        _ => Err(ConfigError::unknown_component("optimizer", name).into()),
    }
}

fn open_source(name: &str, split: Split, config: &RunConfig) -> Result<Box<dyn DataSource>> {
    match name.to_ascii_lowercase().as_str() {
        "folder" => {
            let root = config.data_dir.join(split.as_str());
            Ok(Box::new(FolderDataset::open(root)?))
        }
        "synthetic" => {
            let (len, seed) = match split {
                Split::Train => (SYNTHETIC_TRAIN_LEN, config.seed),
                Split::Val => (SYNTHETIC_VAL_LEN, config.seed.wrapping_add(1)),
            };
            Ok(Box::new(SyntheticDataset::new(len, SYNTHETIC_SIZE, seed)))
        }
        _ => Err(ConfigError::unknown_component("dataset", name).into()),
    }
}

/// Loader for `split`. Training batches are shuffled and repeated; validation
/// visits every sample once, one at a time, in a fixed order.
pub fn data_factory(
    name: &str,
    split: Split,
    config: &RunConfig,
    device: &Device,
) -> Result<DataLoader> {
    let source = open_source(name, split, config)?;
    tracing::info!(dataset = name, split = split.as_str(), samples = source.len(), "data source ready");
    let loader = match split {
        Split::Train => DataLoader::new(source, config.batch_size, device)
            .shuffled(config.seed)
            .with_repeats(config.repeats)
            .with_crop(config.crop_size),
        Split::Val => DataLoader::new(source, 1, device).with_crop(config.crop_size),
    };
    Ok(loader)
}

/// Assemble the change-detection task described by `config`.
pub fn build_task(config: &RunConfig) -> Result<ChangeDetectionTask> {
    let device = open_device(config.device_spec()?)?;
    let network = model_factory(&config.model, &device)?;
    let criterion = critn_factory(&config.criterion)?;
    let metrics = metric_factory(&config.metrics)?;
    let val_loader = data_factory(&config.dataset, Split::Val, config, &device)?;

    if !config.is_training() {
        return Ok(ChangeDetectionTask::for_evaluation(
            network,
            criterion,
            metrics,
            val_loader,
            config.batch_size,
        ));
    }
    let optimizer = optim_factory(&config.optimizer, &network, config)?;
    let train_loader = data_factory(&config.dataset, Split::Train, config, &device)?;
    tracing::info!(
        model = network.name(),
        params = network.parameter_count(),
        optimizer = optimizer.kind(),
        "task assembled"
    );
    Ok(ChangeDetectionTask::for_training(
        network,
        criterion,
        metrics,
        val_loader,
        config.batch_size,
        optimizer,
        train_loader,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MlError;
    use cdtrain_core::{Command, Task};

    fn unknown(err: MlError) -> bool {
        matches!(err, MlError::Config(ConfigError::UnknownComponent { .. }))
    }

    #[test]
    fn test_unknown_names_are_config_errors() {
        let cfg = RunConfig::default();
        let net = model_factory("siamdiff", &Device::Cpu).unwrap();
        assert!(unknown(model_factory("fcn", &Device::Cpu).err().unwrap()));
        assert!(unknown(critn_factory("BCE").err().unwrap()));
        assert!(unknown(optim_factory("lamb", &net, &cfg).err().unwrap()));
        assert!(unknown(data_factory("levir", Split::Val, &cfg, &Device::Cpu).err().unwrap()));
    }

    #[test]
    fn test_criterion_aliases() {
        assert!(critn_factory("nll").is_ok());
        assert!(critn_factory("CE").is_ok());
    }

    #[test]
    fn test_optimizer_uses_configured_hyper_parameters() {
        let cfg = RunConfig {
            lr: 0.01,
            momentum: 0.5,
            weight_decay: 0.001,
            ..Default::default()
        };
        let net = model_factory("ef", &Device::Cpu).unwrap();
        let opt = optim_factory("SGD", &net, &cfg).unwrap();
        let group = &cdtrain_core::Optimizer::param_groups(&opt)[0];
        assert_eq!((group.lr, group.momentum, group.weight_decay), (0.01, 0.5, 0.001));
    }

    #[test]
    fn test_evaluation_task_has_no_optimizer() {
        let cfg = RunConfig {
            cmd: Command::Val,
            ..Default::default()
        };
        let task = build_task(&cfg).unwrap();
        assert!(task.optimizer().is_none());
    }

    #[test]
    fn test_training_task_has_optimizer() {
        let task = build_task(&RunConfig::default()).unwrap();
        assert_eq!(task.learning_rate(), Some(RunConfig::default().lr));
    }

    #[test]
    fn test_training_loader_repeats_and_batches() {
        let cfg = RunConfig {
            batch_size: 5,
            repeats: 2,
            ..Default::default()
        };
        let loader = data_factory("synthetic", Split::Train, &cfg, &Device::Cpu).unwrap();
        assert_eq!(loader.num_batches(), (2 * SYNTHETIC_TRAIN_LEN).div_ceil(5));
        let val = data_factory("synthetic", Split::Val, &cfg, &Device::Cpu).unwrap();
        assert_eq!(val.num_batches(), SYNTHETIC_VAL_LEN);
    }
}
