//! Change-detection architectures.
//!
//! Every network maps an image pair `(B, C, H, W)` × 2 to per-pixel class
//! logits of shape `(B, 2, H, W)`.

mod early_fusion;
mod siamdiff;

pub use early_fusion::EarlyFusion;
pub use siamdiff::SiamDiff;

use candle_core::{Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Module, VarBuilder};

/// Number of output classes (unchanged / changed).
pub const NUM_CLASSES: usize = 2;

/// Channel width of the first convolutional stage.
pub const BASE_WIDTH: usize = 16;

/// A bi-temporal network.
pub trait ChangeDetector: Send {
    fn forward(&self, t1: &Tensor, t2: &Tensor) -> Result<Tensor>;
}

/// 3×3 convolution followed by ReLU; spatial size is preserved.
struct ConvRelu {
    conv: Conv2d,
}

impl ConvRelu {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(in_channels, out_channels, 3, cfg, vb)?;
        Ok(Self { conv })
    }
}

impl Module for ConvRelu {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(xs)?.relu()
    }
}

/// Two stacked [`ConvRelu`] blocks.
struct DoubleConv {
    first: ConvRelu,
    second: ConvRelu,
}

impl DoubleConv {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            first: ConvRelu::new(in_channels, out_channels, vb.pp("conv1"))?,
            second: ConvRelu::new(out_channels, out_channels, vb.pp("conv2"))?,
        })
    }
}

impl Module for DoubleConv {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.second.forward(&self.first.forward(xs)?)
    }
}

/// Feature refinement followed by a 1×1 classifier.
struct Head {
    refine: ConvRelu,
    classifier: Conv2d,
}

impl Head {
    fn new(in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let refine = ConvRelu::new(in_channels, in_channels, vb.pp("refine"))?;
        let classifier = candle_nn::conv2d(
            in_channels,
            NUM_CLASSES,
            1,
            Conv2dConfig::default(),
            vb.pp("classifier"),
        )?;
        Ok(Self { refine, classifier })
    }
}

impl Module for Head {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.classifier.forward(&self.refine.forward(xs)?)
    }
}

/// Names accepted by [`build`].
pub const MODEL_NAMES: &[&str] = &["siamdiff", "ef"];

/// Construct the named architecture, registering its parameters under `vb`.
///
/// Returns `None` for an unknown name.
pub fn build(
    name: &str,
    in_channels: usize,
    vb: VarBuilder,
) -> Option<Result<Box<dyn ChangeDetector>>> {
    let model: Result<Box<dyn ChangeDetector>> = match name.to_ascii_lowercase().as_str() {
        "siamdiff" => SiamDiff::new(in_channels, BASE_WIDTH, vb).map(|m| Box::new(m) as _),
        "ef" | "early_fusion" => {
            EarlyFusion::new(in_channels, BASE_WIDTH, vb).map(|m| Box::new(m) as _)
        }
        _ => return None,
    };
    Some(model)
}
