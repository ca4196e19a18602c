//! SGD and Adam over candle variables, with serializable state.
//!
//! Both optimizers keep a single parameter group covering every variable of
//! the network. Their state dicts hold the group hyper-parameters plus the
//! per-parameter buffers, keyed by parameter name, so they round-trip through
//! checkpoints.

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use cdtrain_core::{Optimizer, OptimizerState, ParamGroup, TensorPayload};
use serde::{Deserialize, Serialize};

use crate::error::{MlError, Result};
use crate::tensor::{from_payload, to_payload};

pub const ADAM_BETA1: f64 = 0.9;
pub const ADAM_BETA2: f64 = 0.999;
pub const ADAM_EPS: f64 = 1e-8;

/// On-disk form of an optimizer state dict.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedState {
    kind: String,
    param_groups: Vec<ParamGroup>,
    #[serde(default)]
    step: u64,
    /// parameter name → buffer name → values
    #[serde(default)]
    state: BTreeMap<String, BTreeMap<String, TensorPayload>>,
}

impl SavedState {
    fn into_map(self) -> Result<OptimizerState> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(MlError::optimizer("optimizer state is not an object")),
        }
    }

    fn from_map(map: &OptimizerState, kind: &str) -> Result<Self> {
        let saved: SavedState = serde_json::from_value(serde_json::Value::Object(map.clone()))?;
        if saved.kind != kind {
            return Err(MlError::optimizer(format!(
                "cannot load {} state into {kind}",
                saved.kind
            )));
        }
        if saved.param_groups.len() != 1 {
            return Err(MlError::optimizer(format!(
                "expected 1 param group, found {}",
                saved.param_groups.len()
            )));
        }
        Ok(saved)
    }
}

/// Restore the buffers named `buffer` for the parameters in `params`.
///
/// Entries for unknown parameters or with a different shape are skipped.
fn restore_buffers(
    saved: &BTreeMap<String, BTreeMap<String, TensorPayload>>,
    params: &[(String, Var)],
    buffer: &str,
) -> Result<BTreeMap<String, Var>> {
    let mut out = BTreeMap::new();
    for (name, var) in params {
        let Some(payload) = saved.get(name).and_then(|b| b.get(buffer)) else {
            continue;
        };
        if payload.shape.as_slice() != var.dims() {
            tracing::warn!(param = %name, buffer, "skipping optimizer buffer with mismatched shape");
            continue;
        }
        let tensor = from_payload(payload, var.device())?;
        out.insert(name.clone(), Var::from_tensor(&tensor)?);
    }
    Ok(out)
}

/// `buf = decay * buf + scale * x`, starting from `scale * x`.
///
/// Buffers are variables so that `set` copies values and drops the graph.
fn accumulate(
    buffers: &mut BTreeMap<String, Var>,
    name: &str,
    decay: f64,
    scale: f64,
    x: &Tensor,
) -> Result<Tensor> {
    let term = x.affine(scale, 0.0)?;
    match buffers.get(name) {
        Some(buf) => {
            buf.set(&(buf.affine(decay, 0.0)? + term)?)?;
            Ok(buf.as_tensor().clone())
        }
        None => {
            let buf = Var::from_tensor(&term)?;
            let out = buf.as_tensor().clone();
            buffers.insert(name.to_string(), buf);
            Ok(out)
        }
    }
}

/// Stochastic gradient descent with optional momentum and L2 weight decay.
pub struct Sgd {
    params: Vec<(String, Var)>,
    groups: [ParamGroup; 1],
    velocity: BTreeMap<String, Var>,
}

impl Sgd {
    pub fn new(params: Vec<(String, Var)>, lr: f64, momentum: f64, weight_decay: f64) -> Self {
        Self {
            params,
            groups: [ParamGroup {
                lr,
                weight_decay,
                momentum,
            }],
            velocity: BTreeMap::new(),
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        let ParamGroup {
            lr,
            weight_decay,
            momentum,
        } = self.groups[0].clone();
        for (name, var) in &self.params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let mut d_p = grad.clone();
            if weight_decay != 0.0 {
                d_p = (d_p + var.as_tensor().affine(weight_decay, 0.0)?)?;
            }
            if momentum != 0.0 {
                // v = momentum * v + g; the first step starts from g.
                d_p = accumulate(&mut self.velocity, name, momentum, 1.0, &d_p)?;
            }
            var.set(&var.as_tensor().sub(&d_p.affine(lr, 0.0)?)?)?;
        }
        Ok(())
    }

    fn saved_state(&self) -> Result<SavedState> {
        let mut state = BTreeMap::new();
        for (name, v) in &self.velocity {
            let mut buffers = BTreeMap::new();
            buffers.insert("momentum_buffer".to_string(), to_payload(v.as_tensor())?);
            state.insert(name.clone(), buffers);
        }
        Ok(SavedState {
            kind: "sgd".into(),
            param_groups: self.groups.to_vec(),
            step: 0,
            state,
        })
    }

    fn load_saved(&mut self, saved: SavedState) -> Result<()> {
        self.velocity = restore_buffers(&saved.state, &self.params, "momentum_buffer")?;
        self.groups = [saved.param_groups[0].clone()];
        Ok(())
    }
}

/// Adam with bias-corrected moments and L2 weight decay folded into the gradient.
pub struct Adam {
    params: Vec<(String, Var)>,
    groups: [ParamGroup; 1],
    t: u64,
    m: BTreeMap<String, Var>,
    v: BTreeMap<String, Var>,
}

impl Adam {
    pub fn new(params: Vec<(String, Var)>, lr: f64, weight_decay: f64) -> Self {
        Self {
            params,
            groups: [ParamGroup {
                lr,
                weight_decay,
                momentum: 0.0,
            }],
            t: 0,
            m: BTreeMap::new(),
            v: BTreeMap::new(),
        }
    }

    /// Number of steps taken so far.
    pub fn steps(&self) -> u64 {
        self.t
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.t += 1;
        let ParamGroup {
            lr, weight_decay, ..
        } = self.groups[0].clone();
        let bc1 = 1.0 - ADAM_BETA1.powi(self.t as i32);
        let bc2 = 1.0 - ADAM_BETA2.powi(self.t as i32);

        for (name, var) in &self.params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let mut g = grad.clone();
            if weight_decay != 0.0 {
                g = (g + var.as_tensor().affine(weight_decay, 0.0)?)?;
            }

            let m = accumulate(&mut self.m, name, ADAM_BETA1, 1.0 - ADAM_BETA1, &g)?;
            let v = accumulate(&mut self.v, name, ADAM_BETA2, 1.0 - ADAM_BETA2, &g.sqr()?)?;

            let m_hat = m.affine(1.0 / bc1, 0.0)?;
            let denom = v.affine(1.0 / bc2, 0.0)?.sqrt()?.affine(1.0, ADAM_EPS)?;
            let update = m_hat.div(&denom)?.affine(lr, 0.0)?;
            var.set(&var.as_tensor().sub(&update)?)?;
        }
        Ok(())
    }

    fn saved_state(&self) -> Result<SavedState> {
        let mut state = BTreeMap::new();
        for (name, m) in &self.m {
            let mut buffers = BTreeMap::new();
            buffers.insert("exp_avg".to_string(), to_payload(m.as_tensor())?);
            if let Some(v) = self.v.get(name) {
                buffers.insert("exp_avg_sq".to_string(), to_payload(v.as_tensor())?);
            }
            state.insert(name.clone(), buffers);
        }
        Ok(SavedState {
            kind: "adam".into(),
            param_groups: self.groups.to_vec(),
            step: self.t,
            state,
        })
    }

    fn load_saved(&mut self, saved: SavedState) -> Result<()> {
        self.m = restore_buffers(&saved.state, &self.params, "exp_avg")?;
        self.v = restore_buffers(&saved.state, &self.params, "exp_avg_sq")?;
        self.t = saved.step;
        self.groups = [saved.param_groups[0].clone()];
        Ok(())
    }
}

/// Optimizer selected by name at startup.
pub enum AnyOptimizer {
    Sgd(Sgd),
    Adam(Adam),
}

impl AnyOptimizer {
    pub fn kind(&self) -> &'static str {
        match self {
            AnyOptimizer::Sgd(_) => "sgd",
            AnyOptimizer::Adam(_) => "adam",
        }
    }

    /// Back-propagate `loss` and update every parameter.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        match self {
            AnyOptimizer::Sgd(opt) => opt.step(&grads),
            AnyOptimizer::Adam(opt) => opt.step(&grads),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.param_groups()[0].lr
    }

    fn saved_state(&self) -> Result<SavedState> {
        match self {
            AnyOptimizer::Sgd(opt) => opt.saved_state(),
            AnyOptimizer::Adam(opt) => opt.saved_state(),
        }
    }

    fn load_map(&mut self, map: &OptimizerState) -> Result<()> {
        let saved = SavedState::from_map(map, self.kind())?;
        match self {
            AnyOptimizer::Sgd(opt) => opt.load_saved(saved),
            AnyOptimizer::Adam(opt) => opt.load_saved(saved),
        }
    }
}

impl Optimizer for AnyOptimizer {
    fn param_groups(&self) -> &[ParamGroup] {
        match self {
            AnyOptimizer::Sgd(opt) => &opt.groups,
            AnyOptimizer::Adam(opt) => &opt.groups,
        }
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        match self {
            AnyOptimizer::Sgd(opt) => &mut opt.groups,
            AnyOptimizer::Adam(opt) => &mut opt.groups,
        }
    }

    fn state_dict(&self) -> cdtrain_core::Result<OptimizerState> {
        Ok(self.saved_state()?.into_map()?)
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> cdtrain_core::Result<()> {
        Ok(self.load_map(state)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use pretty_assertions::assert_eq;

    fn param(values: &[f32]) -> (String, Var) {
        let var = Var::from_slice(values, values.len(), &Device::Cpu).unwrap();
        ("w".to_string(), var)
    }

    fn values(var: &Var) -> Vec<f32> {
        var.as_tensor().to_vec1::<f32>().unwrap()
    }

    /// loss = sum(w * w), so grad = 2w.
    fn quadratic_step(opt: &mut AnyOptimizer, var: &Var) {
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();
    }

    #[test]
    fn test_plain_sgd_follows_gradient() {
        let (name, var) = param(&[1.0, -2.0]);
        let mut opt = AnyOptimizer::Sgd(Sgd::new(vec![(name, var.clone())], 0.1, 0.0, 0.0));
        quadratic_step(&mut opt, &var);
        let w = values(&var);
        assert!((w[0] - 0.8).abs() < 1e-6);
        assert!((w[1] + 1.6).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let (name, var) = param(&[1.0]);
        let mut opt = AnyOptimizer::Sgd(Sgd::new(vec![(name, var.clone())], 0.1, 0.9, 0.0));
        quadratic_step(&mut opt, &var);
        // w1 = 1 - 0.1 * 2 = 0.8; v1 = 2
        quadratic_step(&mut opt, &var);
        // v2 = 0.9 * 2 + 1.6 = 3.4; w2 = 0.8 - 0.34
        assert!((values(&var)[0] - 0.46).abs() < 1e-6);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let (name, var) = param(&[1.0, -1.0]);
        let mut opt = AnyOptimizer::Adam(Adam::new(vec![(name, var.clone())], 0.01, 0.0));
        quadratic_step(&mut opt, &var);
        let w = values(&var);
        assert!((w[0] - 0.99).abs() < 1e-5);
        assert!((w[1] + 0.99).abs() < 1e-5);
    }

    #[test]
    fn test_learning_rate_is_read_from_group() {
        let (name, var) = param(&[1.0]);
        let mut opt = AnyOptimizer::Adam(Adam::new(vec![(name, var)], 0.01, 0.0));
        opt.param_groups_mut()[0].lr = 0.5;
        assert_eq!(opt.learning_rate(), 0.5);
    }

    #[test]
    fn test_adam_state_round_trips() {
        let (name, var) = param(&[1.0, 2.0]);
        let mut opt = AnyOptimizer::Adam(Adam::new(vec![(name.clone(), var.clone())], 0.01, 1e-4));
        quadratic_step(&mut opt, &var);
        quadratic_step(&mut opt, &var);
        let state = opt.state_dict().unwrap();
        assert_eq!(state["step"], serde_json::json!(2));

        let mut fresh = AnyOptimizer::Adam(Adam::new(vec![(name, var)], 0.5, 0.0));
        fresh.load_state_dict(&state).unwrap();
        assert_eq!(fresh.state_dict().unwrap(), state);
        assert_eq!(fresh.param_groups()[0].weight_decay, 1e-4);
    }

    #[test]
    fn test_sgd_state_holds_momentum_buffers() {
        let (name, var) = param(&[3.0]);
        let mut opt = AnyOptimizer::Sgd(Sgd::new(vec![(name, var.clone())], 0.1, 0.9, 0.0));
        quadratic_step(&mut opt, &var);
        let state = opt.state_dict().unwrap();
        assert_eq!(state["state"]["w"]["momentum_buffer"]["data"], serde_json::json!([6.0]));
    }

    #[test]
    fn test_loading_foreign_optimizer_state_fails() {
        let (name, var) = param(&[1.0]);
        let sgd = AnyOptimizer::Sgd(Sgd::new(vec![(name.clone(), var.clone())], 0.1, 0.9, 0.0));
        let mut adam = AnyOptimizer::Adam(Adam::new(vec![(name, var)], 0.1, 0.0));
        assert!(adam.load_state_dict(&sgd.state_dict().unwrap()).is_err());
    }

    #[test]
    fn test_parameters_without_gradient_are_left_alone() {
        let (name, var) = param(&[1.0]);
        let other = Var::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let mut opt = AnyOptimizer::Sgd(Sgd::new(
            vec![(name, var.clone()), ("other".into(), other.clone())],
            0.1,
            0.0,
            0.0,
        ));
        let loss = other.as_tensor().affine(0.0, 1.0).unwrap().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();
        assert_eq!(values(&var), vec![1.0]);
        assert_eq!(values(&other), vec![0.0]);
    }
}
