//! Metric accumulators for validation passes.
//!
//! Every metric scores one binary change map against its label and folds the
//! per-sample score into an [`AverageMeter`]. The set is reset at the start of
//! each validation epoch.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Running weighted average.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AverageMeter {
    val: f64,
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record `val` observed `n` times.
    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
    }

    /// Most recent value.
    pub fn val(&self) -> f64 {
        self.val
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// A resettable statistic over binary change maps.
pub trait Metric: Send {
    fn name(&self) -> &str;

    /// Score one prediction/label pair, fold it into the running average and return it.
    fn update(&mut self, pred: &[u8], label: &[u8]) -> f64;

    fn reset(&mut self);

    fn meter(&self) -> &AverageMeter;

    fn avg(&self) -> f64 {
        self.meter().avg()
    }
}

/// Binary confusion counts; any non-zero pixel is "changed".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Confusion {
    pub tp: u64,
    pub fp: u64,
    pub tn: u64,
    pub fn_: u64,
}

impl Confusion {
    pub fn from_maps(pred: &[u8], label: &[u8]) -> Self {
        let mut c = Confusion::default();
        for (&p, &l) in pred.iter().zip(label) {
            match (p != 0, l != 0) {
                (true, true) => c.tp += 1,
                (true, false) => c.fp += 1,
                (false, false) => c.tn += 1,
                (false, true) => c.fn_ += 1,
            }
        }
        c
    }

    fn total(&self) -> f64 {
        (self.tp + self.fp + self.tn + self.fn_) as f64
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 { 0.0 } else { num / den }
}

/// Supported binary change-detection metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Precision,
    Recall,
    F1Score,
    Accuracy,
    IoU,
    Kappa,
}

impl MetricKind {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "Precision" => Ok(MetricKind::Precision),
            "Recall" => Ok(MetricKind::Recall),
            "F1Score" | "F1" => Ok(MetricKind::F1Score),
            "OA" | "Accuracy" => Ok(MetricKind::Accuracy),
            "IoU" => Ok(MetricKind::IoU),
            "Kappa" => Ok(MetricKind::Kappa),
            other => Err(ConfigError::unknown_component("metric", other)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::Precision => "Precision",
            MetricKind::Recall => "Recall",
            MetricKind::F1Score => "F1Score",
            MetricKind::Accuracy => "OA",
            MetricKind::IoU => "IoU",
            MetricKind::Kappa => "Kappa",
        }
    }

    pub fn score(&self, c: &Confusion) -> f64 {
        let (tp, fp, tn, fn_) = (c.tp as f64, c.fp as f64, c.tn as f64, c.fn_ as f64);
        match self {
            MetricKind::Precision => ratio(tp, tp + fp),
            MetricKind::Recall => ratio(tp, tp + fn_),
            MetricKind::F1Score => ratio(2.0 * tp, 2.0 * tp + fp + fn_),
            MetricKind::Accuracy => ratio(tp + tn, c.total()),
            MetricKind::IoU => ratio(tp, tp + fp + fn_),
            MetricKind::Kappa => {
                let n = c.total();
                if n == 0.0 {
                    return 0.0;
                }
                let po = (tp + tn) / n;
                let pe = ((tp + fp) * (tp + fn_) + (fn_ + tn) * (fp + tn)) / (n * n);
                if pe >= 1.0 { 0.0 } else { (po - pe) / (1.0 - pe) }
            }
        }
    }
}

/// Metric computed per sample from the binary confusion counts.
#[derive(Debug, Clone)]
pub struct BinaryMetric {
    kind: MetricKind,
    meter: AverageMeter,
}

impl BinaryMetric {
    pub fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            meter: AverageMeter::new(),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }
}

impl Metric for BinaryMetric {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn update(&mut self, pred: &[u8], label: &[u8]) -> f64 {
        let score = self.kind.score(&Confusion::from_maps(pred, label));
        self.meter.update(score, 1);
        score
    }

    fn reset(&mut self) {
        self.meter.reset();
    }

    fn meter(&self) -> &AverageMeter {
        &self.meter
    }
}

/// Ordered collection of metrics. The first one drives best-model selection.
#[derive(Default)]
pub struct MetricSet {
    metrics: Vec<Box<dyn Metric>>,
}

impl MetricSet {
    pub fn new(metrics: Vec<Box<dyn Metric>>) -> Self {
        Self { metrics }
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn reset(&mut self) {
        for m in &mut self.metrics {
            m.reset();
        }
    }

    pub fn update(&mut self, pred: &[u8], label: &[u8]) {
        for m in &mut self.metrics {
            m.update(pred, label);
        }
    }

    /// Average of the first metric, if any metric is configured.
    pub fn primary(&self) -> Option<f64> {
        self.metrics.first().map(|m| m.avg())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Metric> {
        self.metrics.iter().map(|m| m.as_ref())
    }
}

impl std::fmt::Debug for MetricSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.metrics.iter().map(|m| (m.name().to_string(), m.avg())))
            .finish()
    }
}

/// Build the metric set named in the configuration.
pub fn metric_factory(names: &[String]) -> Result<MetricSet, ConfigError> {
    let metrics = names
        .iter()
        .map(|name| {
            MetricKind::from_name(name).map(|k| Box::new(BinaryMetric::new(k)) as Box<dyn Metric>)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MetricSet::new(metrics))
}
