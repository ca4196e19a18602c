//! Early fusion: the image pair is concatenated along channels before encoding.

use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use super::{ChangeDetector, DoubleConv, Head};

pub struct EarlyFusion {
    encoder: DoubleConv,
    head: Head,
}

impl EarlyFusion {
    pub fn new(in_channels: usize, width: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            encoder: DoubleConv::new(2 * in_channels, width, vb.pp("encoder"))?,
            head: Head::new(width, vb.pp("head"))?,
        })
    }
}

impl ChangeDetector for EarlyFusion {
    fn forward(&self, t1: &Tensor, t2: &Tensor) -> Result<Tensor> {
        let x = Tensor::cat(&[t1, t2], 1)?;
        self.head.forward(&self.encoder.forward(&x)?)
    }
}
