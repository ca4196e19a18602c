//! Siamese encoder with absolute feature difference.

use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use super::{ChangeDetector, DoubleConv, Head};

/// Both images pass through one shared encoder; the head classifies
/// `|f(t1) - f(t2)|`.
pub struct SiamDiff {
    encoder: DoubleConv,
    head: Head,
}

impl SiamDiff {
    pub fn new(in_channels: usize, width: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            encoder: DoubleConv::new(in_channels, width, vb.pp("encoder"))?,
            head: Head::new(width, vb.pp("head"))?,
        })
    }
}

impl ChangeDetector for SiamDiff {
    fn forward(&self, t1: &Tensor, t2: &Tensor) -> Result<Tensor> {
        let f1 = self.encoder.forward(t1)?;
        let f2 = self.encoder.forward(t2)?;
        let diff = (f1 - f2)?.abs()?;
        self.head.forward(&diff)
    }
}
