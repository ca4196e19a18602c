//! Binary change-detection task: the train and validate steps.

use candle_core::DType;
use cdtrain_core::{
    AverageMeter, EpochEnv, MetricSet, Optimizer, Stateful, Task, make_desc,
};
use indicatif::{ProgressBar, ProgressStyle};

use crate::criterion::NllLoss;
use crate::data::{DataLoader, write_change_map};
use crate::error::{MlError, Result};
use crate::network::Network;
use crate::optim::AnyOptimizer;

/// Everything needed to train or evaluate a change detector.
pub struct ChangeDetectionTask {
    network: Network,
    criterion: NllLoss,
    optimizer: Option<AnyOptimizer>,
    metrics: MetricSet,
    train_loader: Option<DataLoader>,
    val_loader: DataLoader,
    batch_size: usize,
}

impl ChangeDetectionTask {
    /// Task for evaluation only: no optimizer, no training source.
    pub fn for_evaluation(
        network: Network,
        criterion: NllLoss,
        metrics: MetricSet,
        val_loader: DataLoader,
        batch_size: usize,
    ) -> Self {
        Self {
            network,
            criterion,
            optimizer: None,
            metrics,
            train_loader: None,
            val_loader,
            batch_size,
        }
    }

    /// Task for training with `optimizer` over `train_loader`.
    pub fn for_training(
        network: Network,
        criterion: NllLoss,
        metrics: MetricSet,
        val_loader: DataLoader,
        batch_size: usize,
        optimizer: AnyOptimizer,
        train_loader: DataLoader,
    ) -> Self {
        Self {
            optimizer: Some(optimizer),
            train_loader: Some(train_loader),
            ..Self::for_evaluation(network, criterion, metrics, val_loader, batch_size)
        }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn metrics(&self) -> &MetricSet {
        &self.metrics
    }

    pub fn learning_rate(&self) -> Option<f64> {
        self.optimizer.as_ref().map(AnyOptimizer::learning_rate)
    }

    /// Bars draw to stderr and stay hidden when it is not a terminal.
    fn progress_bar(total: usize) -> ProgressBar {
        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }

    fn run_train_epoch(&mut self, env: &EpochEnv<'_>) -> Result<()> {
        let Self {
            network,
            criterion,
            optimizer,
            train_loader,
            batch_size,
            ..
        } = self;
        let (Some(optimizer), Some(loader)) = (optimizer.as_mut(), train_loader.as_mut()) else {
            return Err(MlError::model("training requires an optimizer and a training source"));
        };

        let batches = loader.epoch_batches();
        let len_train = batches.len();
        let pb = Self::progress_bar(len_train);
        let mut losses = AverageMeter::new();

        for (i, indices) in batches.iter().enumerate() {
            let batch = loader.load(indices)?;
            let prob = network.forward(&batch.t1, &batch.t2)?;
            let loss = criterion.forward(&prob, &batch.label)?;
            losses.update(f64::from(loss.to_scalar::<f32>()?), *batch_size);

            optimizer.backward_step(&loss)?;

            let desc = make_desc(i + 1, len_train, &[("loss", &losses)]);
            pb.set_message(desc.clone());
            pb.inc(1);
            env.logger.dump(&desc);
        }
        pb.finish_and_clear();
        Ok(())
    }

    fn run_validate_epoch(&mut self, epoch: usize, store: bool, env: &EpochEnv<'_>) -> Result<f64> {
        env.logger.show_nl(&format!("Epoch: [{epoch}]"));

        let batches = self.val_loader.epoch_batches();
        let len_val = batches.len();
        let pb = Self::progress_bar(len_val);
        let mut losses = AverageMeter::new();

        for (i, indices) in batches.iter().enumerate() {
            if env.is_training() && i >= env.config.val_iters {
                // Do not validate all images while training
                pb.finish_and_clear();
                env.logger.warning("validation ends early");
                break;
            }
            let batch = self.val_loader.load(indices)?;
            let prob = self.network.forward(&batch.t1, &batch.t2)?;
            let loss = self.criterion.forward(&prob, &batch.label)?;
            losses.update(f64::from(loss.to_scalar::<f32>()?), self.batch_size);

            let change_maps = prob.argmax(1)?.to_dtype(DType::U8)?;
            for (b, label) in batch.label_maps.iter().enumerate() {
                let cm = change_maps.get(b)?.flatten_all()?.to_vec1::<u8>()?;
                self.metrics.update(&cm, label);
                if store {
                    let path = env.paths.output_path(epoch, &batch.names[b])?;
                    write_change_map(&path, &cm, batch.height, batch.width)?;
                }
            }

            let mut items: Vec<(&str, &AverageMeter)> = vec![("loss", &losses)];
            items.extend(self.metrics.iter().map(|m| (m.name(), m.meter())));
            let desc = make_desc(i + 1, len_val, &items);
            pb.set_message(desc.clone());
            pb.inc(1);
            env.logger.dump(&desc);
        }
        pb.finish_and_clear();

        Ok(self
            .metrics
            .primary()
            .unwrap_or_else(|| (1.0 - losses.avg()).max(0.0)))
    }
}

impl Task for ChangeDetectionTask {
    fn model(&self) -> &dyn Stateful {
        &self.network
    }

    fn model_mut(&mut self) -> &mut dyn Stateful {
        &mut self.network
    }

    fn optimizer(&self) -> Option<&dyn Optimizer> {
        self.optimizer.as_ref().map(|o| o as &dyn Optimizer)
    }

    fn optimizer_mut(&mut self) -> Option<&mut dyn Optimizer> {
        self.optimizer.as_mut().map(|o| o as &mut dyn Optimizer)
    }

    fn metrics_mut(&mut self) -> &mut MetricSet {
        &mut self.metrics
    }

    fn train_epoch(&mut self, _epoch: usize, env: &EpochEnv<'_>) -> cdtrain_core::Result<()> {
        Ok(self.run_train_epoch(env)?)
    }

    fn validate_epoch(
        &mut self,
        epoch: usize,
        store: bool,
        env: &EpochEnv<'_>,
    ) -> cdtrain_core::Result<f64> {
        Ok(self.run_validate_epoch(epoch, store, env)?)
    }
}
