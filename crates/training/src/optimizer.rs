use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Momentum SGD over named parameter slots. Velocity buffers are kept in
/// f32 regardless of the parameter dtype; weight decay is folded into the
/// gradient before the velocity update:
///
///   g <- g + weight_decay * p
///   v <- momentum * v + g
///   p <- p - lr * v
///
/// The optimizer also owns the global step counter, incremented exactly
/// once per successful `step` call.
#[derive(Debug)]
pub struct MomentumSgd {
    params: Vec<ParameterSlot>,
    learning_rate: f64,
    momentum: f64,
    weight_decay: f64,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    velocity: Tensor,
}

impl MomentumSgd {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        momentum: f64,
        weight_decay: f64,
        learning_rate: f64,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        if !(0.0..1.0).contains(&momentum) {
            return Err(TrainingError::initialization(format!(
                "momentum {momentum} must be in [0, 1)"
            )));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let velocity = Tensor::zeros(tensor.dims(), DType::F32, tensor.device())
                .map_err(to_runtime_error)?;
            params.push(ParameterSlot {
                name,
                dtype: tensor.dtype(),
                param: var,
                velocity,
            });
        }

        Ok(Self {
            params,
            learning_rate,
            momentum,
            weight_decay,
            step: 0,
        })
    }

    /// Global step: number of parameter updates applied so far.
    pub fn global_step(&self) -> usize {
        self.step
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut updated = false;

        for slot in &mut self.params {
            let tensor = slot.param.as_tensor();
            let grad = match grads.remove(tensor) {
                Some(grad) => grad,
                None => continue,
            };

            let mut grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let base = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;

            if self.weight_decay != 0.0 {
                let decay = base.affine(self.weight_decay, 0.0).map_err(to_runtime_error)?;
                grad = grad.add(&decay).map_err(to_runtime_error)?;
            }

            let velocity = slot
                .velocity
                .affine(self.momentum, 0.0)
                .map_err(to_runtime_error)?
                .add(&grad)
                .map_err(to_runtime_error)?;
            let update = velocity
                .affine(self.learning_rate, 0.0)
                .map_err(to_runtime_error)?;
            let next = base.sub(&update).map_err(to_runtime_error)?;

            let cast = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&cast).map_err(to_runtime_error)?;
            slot.velocity = velocity;
            updated = true;
        }

        if !updated {
            return Err(TrainingError::runtime(
                "no parameter received a gradient; nothing to update",
            ));
        }

        self.step += 1;
        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel: usize = shape.iter().product();
            let velocity = flatten_to_vec(&slot.velocity, numel)?;
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                velocity,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        self.step = state.step;
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            let dims = slot.param.as_tensor().dims().to_vec();
            if dims != state.shape {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let expected: usize = dims.iter().product();
            if state.velocity.len() != expected {
                return Err(TrainingError::runtime(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device().clone();
            slot.velocity = Tensor::from_vec(state.velocity, expected, &device)
                .map_err(to_runtime_error)?
                .reshape(dims.as_slice())
                .map_err(to_runtime_error)?;
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub velocity: Vec<f32>,
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn single_param(value: f32) -> Vec<(String, Var)> {
        let var = Var::from_tensor(&Tensor::new(&[value], &Device::Cpu).unwrap()).unwrap();
        vec![("w".to_string(), var)]
    }

    fn grads_for(params: &[(String, Var)], value: f32) -> GradStore {
        // Build a store through a trivial graph so it can hold our entry.
        let loss = (params[0].1.as_tensor() * value as f64).unwrap().sum_all().unwrap();
        loss.backward().unwrap()
    }

    #[test]
    fn velocity_accumulates_across_steps() {
        let params = single_param(1.0);
        let var = params[0].1.clone();
        let mut optimizer = MomentumSgd::new(params, 0.9, 0.0, 0.1).unwrap();

        // Gradient of sum(w * 1.0) with respect to w is 1.
        let mut grads = grads_for(&[("w".to_string(), var.clone())], 1.0);
        optimizer.step(&mut grads).unwrap();
        let after_one = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((after_one - 0.9).abs() < 1e-6);

        let mut grads = grads_for(&[("w".to_string(), var.clone())], 1.0);
        optimizer.step(&mut grads).unwrap();
        // v2 = 0.9 * 1 + 1 = 1.9, p = 0.9 - 0.19 = 0.71
        let after_two = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((after_two - 0.71).abs() < 1e-6);
        assert_eq!(optimizer.global_step(), 2);
    }

    #[test]
    fn global_step_is_one_after_first_update() {
        let params = single_param(0.5);
        let var = params[0].1.clone();
        let mut optimizer = MomentumSgd::new(params, 0.9, 0.0, 0.1).unwrap();
        assert_eq!(optimizer.global_step(), 0);
        let mut grads = grads_for(&[("w".to_string(), var)], 2.0);
        optimizer.step(&mut grads).unwrap();
        assert_eq!(optimizer.global_step(), 1);
    }

    #[test]
    fn empty_gradient_store_is_an_error() {
        let params = single_param(0.5);
        let other = Var::from_tensor(&Tensor::new(&[1f32], &Device::Cpu).unwrap()).unwrap();
        let mut optimizer = MomentumSgd::new(params, 0.9, 0.0, 0.1).unwrap();
        let loss = (other.as_tensor() * 1.0).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        assert!(optimizer.step(&mut grads).is_err());
        assert_eq!(optimizer.global_step(), 0);
    }

    #[test]
    fn state_round_trips_through_serde() {
        let params = single_param(1.0);
        let var = params[0].1.clone();
        let mut optimizer = MomentumSgd::new(params, 0.9, 0.0, 0.1).unwrap();
        let mut grads = grads_for(&[("w".to_string(), var.clone())], 1.0);
        optimizer.step(&mut grads).unwrap();

        let encoded = serde_json::to_string(&optimizer.state().unwrap()).unwrap();
        let decoded: OptimizerState = serde_json::from_str(&encoded).unwrap();

        let fresh_params = vec![("w".to_string(), var)];
        let mut restored = MomentumSgd::new(fresh_params, 0.9, 0.0, 0.1).unwrap();
        restored.load_state(decoded).unwrap();
        assert_eq!(restored.global_step(), 1);
    }

    #[test]
    fn mismatched_state_is_rejected() {
        let params = single_param(1.0);
        let mut optimizer = MomentumSgd::new(params, 0.9, 0.0, 0.1).unwrap();
        let state = OptimizerState {
            step: 3,
            parameters: vec![ParameterState {
                name: "unknown".to_string(),
                shape: vec![1],
                velocity: vec![0.0],
            }],
        };
        assert!(optimizer.load_state(state).is_err());
    }
}
