/// Adam optimizer over named parameters
///
/// Weight decay is L2 regularization added to the gradient (coupled), and the
/// full per-parameter state can be exported and restored for checkpointing.
use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{DepthError, Result};

/// Adam optimizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    /// Learning rate
    pub lr: f64,
    /// Coefficient for the running average of gradients
    pub beta1: f64,
    /// Coefficient for the running average of squared gradients
    pub beta2: f64,
    /// Term added to denominator for numerical stability
    pub eps: f64,
    /// L2 penalty folded into the gradient
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Moment estimates of one parameter
#[derive(Debug, Clone)]
pub struct ParamMoments {
    /// Exponential moving average of gradients
    pub exp_avg: Tensor,
    /// Exponential moving average of squared gradients
    pub exp_avg_sq: Tensor,
}

/// Scalar part of the optimizer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerScalars {
    pub config: AdamConfig,
    /// Steps taken per parameter
    pub steps: BTreeMap<String, usize>,
}

/// Exportable optimizer state
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub scalars: OptimizerScalars,
    pub moments: BTreeMap<String, ParamMoments>,
}

#[derive(Debug, Clone)]
struct ParamState {
    moments: ParamMoments,
    step: usize,
}

/// Adam optimizer
pub struct Adam {
    config: AdamConfig,
    params: Vec<(String, Var)>,
    states: BTreeMap<String, ParamState>,
}

impl Adam {
    /// Create new Adam optimizer over `params`
    pub fn new(params: Vec<(String, Var)>, config: AdamConfig) -> Result<Self> {
        if !(config.lr > 0.0) {
            return Err(DepthError::Config(format!(
                "learning rate must be > 0, got {}",
                config.lr
            )));
        }
        if config.weight_decay < 0.0 {
            return Err(DepthError::Config(format!(
                "weight decay must be >= 0, got {}",
                config.weight_decay
            )));
        }
        Ok(Self {
            config,
            params,
            states: BTreeMap::new(),
        })
    }

    /// Perform a single optimization step
    ///
    /// Parameters without a gradient in `grads` are left untouched.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;

        for (name, var) in &self.params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let param = var.as_detached_tensor();

            let grad = if weight_decay > 0.0 {
                (grad + (&param * weight_decay)?)?
            } else {
                grad.clone()
            };

            if !self.states.contains_key(name) {
                let moments = ParamMoments {
                    exp_avg: param.zeros_like()?,
                    exp_avg_sq: param.zeros_like()?,
                };
                self.states
                    .insert(name.clone(), ParamState { moments, step: 0 });
            }
            let state = self.states.get_mut(name).ok_or_else(|| {
                DepthError::Training(format!("no optimizer state for '{}'", name))
            })?;
            state.step += 1;

            // m = beta1 * m + (1 - beta1) * grad
            let m = ((&state.moments.exp_avg * beta1)? + (&grad * (1.0 - beta1))?)?;
            // v = beta2 * v + (1 - beta2) * grad^2
            let v = ((&state.moments.exp_avg_sq * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let m_hat = (&m / (1.0 - beta1.powi(state.step as i32)))?;
            let v_hat = (&v / (1.0 - beta2.powi(state.step as i32)))?;

            let update = ((m_hat / (v_hat.sqrt()? + eps)?)? * lr)?;
            var.set(&(param - update)?)?;

            state.moments = ParamMoments {
                exp_avg: m,
                exp_avg_sq: v,
            };
        }

        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Parameters being optimized
    pub fn params(&self) -> &[(String, Var)] {
        &self.params
    }

    /// Snapshot of the full optimizer state
    ///
    /// Moment tensors are replaced on every step, so the snapshot cannot
    /// change after it is taken.
    pub fn state_dict(&self) -> OptimizerState {
        let steps = self
            .states
            .iter()
            .map(|(name, s)| (name.clone(), s.step))
            .collect();
        let moments = self
            .states
            .iter()
            .map(|(name, s)| (name.clone(), s.moments.clone()))
            .collect();

        OptimizerState {
            scalars: OptimizerScalars {
                config: self.config.clone(),
                steps,
            },
            moments,
        }
    }

    /// Restore a state produced by [`Adam::state_dict`]
    ///
    /// Every entry must name a known parameter with a matching shape.
    pub fn load_state_dict(&mut self, state: OptimizerState) -> Result<()> {
        let OptimizerState { scalars, moments } = state;

        if scalars.steps.len() != moments.len()
            || scalars.steps.keys().any(|k| !moments.contains_key(k))
        {
            return Err(DepthError::Checkpoint(
                "optimizer step counts and moments name different parameters".to_string(),
            ));
        }

        let mut states = BTreeMap::new();
        for (name, m) in moments {
            let var = self
                .params
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v)
                .ok_or_else(|| {
                    DepthError::Checkpoint(format!(
                        "optimizer state for unknown parameter '{}'",
                        name
                    ))
                })?;

            for moment in [&m.exp_avg, &m.exp_avg_sq] {
                if moment.dims() != var.dims() {
                    return Err(DepthError::Checkpoint(format!(
                        "optimizer state for '{}' has shape {:?}, parameter has {:?}",
                        name,
                        moment.dims(),
                        var.dims()
                    )));
                }
            }

            let device = var.device();
            let dtype = var.dtype();
            let step = scalars.steps.get(&name).copied().unwrap_or(0);
            let moments = ParamMoments {
                exp_avg: m.exp_avg.to_device(device)?.to_dtype(dtype)?,
                exp_avg_sq: m.exp_avg_sq.to_device(device)?.to_dtype(dtype)?,
            };
            states.insert(name, ParamState { moments, step });
        }

        self.config = scalars.config;
        self.states = states;
        Ok(())
    }

    /// Point the optimizer at a new set of parameters (same names) on `device`
    ///
    /// Moments are moved before anything is replaced; on error the optimizer
    /// is unchanged.
    pub fn rebind(&mut self, params: Vec<(String, Var)>, device: &Device) -> Result<()> {
        let mut states = BTreeMap::new();
        for (name, state) in &self.states {
            if !params.iter().any(|(n, _)| n == name) {
                return Err(DepthError::Training(format!(
                    "parameter '{}' missing after rebind",
                    name
                )));
            }
            let moments = ParamMoments {
                exp_avg: state.moments.exp_avg.to_device(device)?,
                exp_avg_sq: state.moments.exp_avg_sq.to_device(device)?,
            };
            states.insert(
                name.clone(),
                ParamState {
                    moments,
                    step: state.step,
                },
            );
        }
        self.states = states;
        self.params = params;
        Ok(())
    }
}
