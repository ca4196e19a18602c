//! Per-pixel classification losses.

use candle_core::{D, DType, Device, Tensor};

use crate::error::{MlError, Result};

/// Negative log-likelihood over log-softmax class scores.
///
/// `logits` are `(B, C, H, W)`, targets are class indices `(B, H, W)`.
#[derive(Debug, Clone)]
pub struct NllLoss {
    weight: Option<Tensor>,
}

impl NllLoss {
    pub fn new() -> Self {
        Self { weight: None }
    }

    /// Weight each class's contribution; the loss is normalised by the summed
    /// weights of the targets.
    pub fn with_weights(weights: &[f32], device: &Device) -> Result<Self> {
        if weights.is_empty() || weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(MlError::model("class weights must be finite and non-negative"));
        }
        Ok(Self {
            weight: Some(Tensor::from_slice(weights, weights.len(), device)?),
        })
    }

    pub fn forward(&self, logits: &Tensor, target: &Tensor) -> Result<Tensor> {
        let (_, classes, _, _) = logits.dims4()?;
        let log_probs = candle_nn::ops::log_softmax(logits, 1)?
            .permute((0, 2, 3, 1))?
            .contiguous()?
            .reshape(((), classes))?;
        let target = target.flatten_all()?.to_dtype(DType::U32)?;

        let Some(weight) = &self.weight else {
            return Ok(candle_nn::loss::nll(&log_probs, &target)?);
        };
        if weight.dim(0)? != classes {
            return Err(MlError::model(format!(
                "{} class weights for {classes} classes",
                weight.dim(0)?
            )));
        }
        let picked = log_probs
            .gather(&target.unsqueeze(1)?, 1)?
            .squeeze(D::Minus1)?;
        let w = weight.index_select(&target, 0)?;
        let total = picked.mul(&w)?.sum_all()?.neg()?;
        Ok(total.div(&w.sum_all()?)?)
    }
}

impl Default for NllLoss {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    fn uniform_logits() -> Tensor {
        Tensor::zeros((1, 2, 2, 2), DType::F32, &Device::Cpu).unwrap()
    }

    fn targets(values: [u32; 4]) -> Tensor {
        Tensor::from_slice(&values, (1, 2, 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_uniform_prediction_costs_log_two() {
        let loss = NllLoss::new()
            .forward(&uniform_logits(), &targets([0, 1, 1, 0]))
            .unwrap();
        assert!((scalar(&loss) - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_confident_correct_prediction_is_cheap() {
        // Class 1 everywhere with a large margin.
        let data: Vec<f32> = [vec![-10.0; 4], vec![10.0; 4]].concat();
        let logits = Tensor::from_vec(data, (1, 2, 2, 2), &Device::Cpu).unwrap();
        let loss = NllLoss::new().forward(&logits, &targets([1; 4])).unwrap();
        assert!(scalar(&loss) < 1e-3);
    }

    #[test]
    fn test_weights_do_not_change_uniform_loss() {
        let loss = NllLoss::with_weights(&[1.0, 3.0], &Device::Cpu)
            .unwrap()
            .forward(&uniform_logits(), &targets([0, 1, 1, 1]))
            .unwrap();
        assert!((scalar(&loss) - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_weight_count_must_match_classes() {
        let loss = NllLoss::with_weights(&[1.0, 1.0, 1.0], &Device::Cpu).unwrap();
        assert!(loss.forward(&uniform_logits(), &targets([0; 4])).is_err());
    }

    #[test]
    fn test_negative_weights_are_rejected() {
        assert!(NllLoss::with_weights(&[1.0, -1.0], &Device::Cpu).is_err());
    }
}
