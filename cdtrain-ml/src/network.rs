//! A change-detection network together with the variables it owns.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use cdtrain_core::{ConfigError, StateDict, Stateful};

use crate::error::{MlError, Result};
use crate::models::{self, ChangeDetector};
use crate::tensor::{from_payload, to_payload};

/// Trainable network: architecture plus its named parameters.
pub struct Network {
    name: String,
    varmap: VarMap,
    device: Device,
    inner: Box<dyn ChangeDetector>,
}

impl Network {
    /// Build the named architecture with freshly initialised weights.
    pub fn new(name: &str, in_channels: usize, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let inner = models::build(name, in_channels, vb)
            .ok_or_else(|| ConfigError::unknown_component("model", name))??;
        tracing::debug!(model = name, params = varmap.all_vars().len(), "network built");
        Ok(Self {
            name: name.to_string(),
            varmap,
            device: device.clone(),
            inner,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn forward(&self, t1: &Tensor, t2: &Tensor) -> Result<Tensor> {
        Ok(self.inner.forward(t1, t2)?)
    }

    /// Parameters sorted by name.
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| MlError::model("parameter store lock poisoned"))?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Total number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    fn snapshot(&self) -> Result<StateDict> {
        self.named_vars()?
            .into_iter()
            .map(|(name, var)| Ok((name, to_payload(var.as_tensor())?)))
            .collect()
    }

    fn restore(&mut self, state: &StateDict) -> Result<()> {
        let vars: std::collections::BTreeMap<String, Var> =
            self.named_vars()?.into_iter().collect();

        // Validate everything first so a bad entry leaves the weights untouched.
        for (name, payload) in state {
            let var = vars
                .get(name)
                .ok_or_else(|| MlError::model(format!("unexpected parameter '{name}'")))?;
            if var.dims() != payload.shape.as_slice() {
                return Err(MlError::model(format!(
                    "shape mismatch for '{name}': model {:?}, state {:?}",
                    var.dims(),
                    payload.shape
                )));
            }
        }
        for (name, payload) in state {
            if let Some(var) = vars.get(name) {
                var.set(&from_payload(payload, &self.device)?)?;
            }
        }
        Ok(())
    }
}

impl Stateful for Network {
    fn state_dict(&self) -> cdtrain_core::Result<StateDict> {
        Ok(self.snapshot()?)
    }

    fn load_state_dict(&mut self, state: &StateDict) -> cdtrain_core::Result<()> {
        Ok(self.restore(state)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdtrain_core::TensorPayload;

    fn input(batch: usize, size: usize) -> Tensor {
        Tensor::rand(0f32, 1f32, (batch, 3, size, size), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_siamdiff_outputs_two_class_logits() {
        let net = Network::new("siamdiff", 3, &Device::Cpu).unwrap();
        let out = net.forward(&input(2, 8), &input(2, 8)).unwrap();
        assert_eq!(out.dims(), &[2, 2, 8, 8]);
    }

    #[test]
    fn test_early_fusion_outputs_two_class_logits() {
        let net = Network::new("ef", 3, &Device::Cpu).unwrap();
        let out = net.forward(&input(1, 6), &input(1, 6)).unwrap();
        assert_eq!(out.dims(), &[1, 2, 6, 6]);
    }

    #[test]
    fn test_unknown_architecture_is_config_error() {
        let err = Network::new("unet", 3, &Device::Cpu).err().unwrap();
        assert!(matches!(err, MlError::Config(ConfigError::UnknownComponent { .. })));
    }

    #[test]
    fn test_state_dict_names_are_hierarchical() {
        let net = Network::new("siamdiff", 3, &Device::Cpu).unwrap();
        let state = net.state_dict().unwrap();
        assert!(state.contains_key("encoder.conv1.weight"));
        assert_eq!(state["encoder.conv1.weight"].shape, vec![16, 3, 3, 3]);
        assert_eq!(state["head.classifier.bias"].shape, vec![2]);
        assert!(net.parameter_count() > 0);
    }

    #[test]
    fn test_state_dict_transfers_between_networks() {
        let src = Network::new("siamdiff", 3, &Device::Cpu).unwrap();
        let mut dst = Network::new("siamdiff", 3, &Device::Cpu).unwrap();
        let state = src.state_dict().unwrap();
        dst.load_state_dict(&state).unwrap();
        assert_eq!(dst.state_dict().unwrap(), state);
    }

    #[test]
    fn test_bad_shape_leaves_weights_untouched() {
        let mut net = Network::new("siamdiff", 3, &Device::Cpu).unwrap();
        let before = net.state_dict().unwrap();
        let mut state = before.clone();
        state.insert("head.classifier.bias".into(), TensorPayload::new(vec![3], vec![0.0; 3]));
        state.insert("encoder.conv1.bias".into(), TensorPayload::new(vec![16], vec![1.0; 16]));
        assert!(net.load_state_dict(&state).is_err());
        assert_eq!(net.state_dict().unwrap(), before);
    }
}
