/// Exponential Moving Average of model weights
///
/// Maintains shadow copies of the named model parameters, updated after
/// every optimizer step. The shadow weights are used for evaluation and
/// export, never trained through gradients.
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use candle_core::{Device, Tensor, Var};

use super::checkpoint::write_safetensors;
use crate::{DepthError, Result};

/// EMA configuration
#[derive(Debug, Clone)]
pub struct EMAConfig {
    /// Weight of the running average:
    /// ema = weight * ema + (1 - weight) * param
    pub weight: f64,
}

impl Default for EMAConfig {
    fn default() -> Self {
        Self { weight: 0.99 }
    }
}

/// Exponential Moving Average tracker
pub struct EMA {
    config: EMAConfig,
    shadow_params: BTreeMap<String, Tensor>,
}

impl EMA {
    /// Create new EMA; `weight` must lie in [0, 1)
    pub fn new(config: EMAConfig) -> Result<Self> {
        if !(0.0..1.0).contains(&config.weight) {
            return Err(DepthError::Config(format!(
                "ema_weight must be in [0, 1), got {}",
                config.weight
            )));
        }
        Ok(Self {
            config,
            shadow_params: BTreeMap::new(),
        })
    }

    pub fn weight(&self) -> f64 {
        self.config.weight
    }

    /// True once the first update (or a reseed) has populated the shadows
    pub fn is_initialized(&self) -> bool {
        !self.shadow_params.is_empty()
    }

    /// Update shadow parameters from the live ones
    ///
    /// The first call copies the live values exactly; later calls blend.
    pub fn update(&mut self, params: &[(String, Var)]) -> Result<()> {
        if !self.is_initialized() {
            return self.copy_from(params);
        }

        let w = self.config.weight;
        for (name, var) in params {
            let shadow = self.shadow_params.get_mut(name).ok_or_else(|| {
                DepthError::Training(format!("EMA has no shadow for parameter '{}'", name))
            })?;
            let live = var.as_detached_tensor();
            *shadow = ((&*shadow * w)? + (live * (1.0 - w))?)?;
        }

        Ok(())
    }

    /// Replace every shadow by a copy of the live parameter
    pub fn copy_from(&mut self, params: &[(String, Var)]) -> Result<()> {
        self.shadow_params.clear();
        for (name, var) in params {
            // Deep copy: Var::set mutates the live storage in place
            let copy = var.as_detached_tensor().copy()?;
            self.shadow_params.insert(name.clone(), copy);
        }
        Ok(())
    }

    /// Shadow parameters keyed by parameter name
    pub fn shadow_params(&self) -> &BTreeMap<String, Tensor> {
        &self.shadow_params
    }

    /// Shadow parameters in the form `VarBuilder::from_tensors` expects
    pub fn to_tensor_map(&self) -> HashMap<String, Tensor> {
        self.shadow_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Copies of the shadows on `device`; `self` is left as is
    pub fn moved_to(&self, device: &Device) -> Result<BTreeMap<String, Tensor>> {
        self.shadow_params
            .iter()
            .map(|(name, shadow)| Ok((name.clone(), shadow.to_device(device)?)))
            .collect()
    }

    /// Swap in shadows produced by [`EMA::moved_to`]
    pub fn replace_shadows(&mut self, shadows: BTreeMap<String, Tensor>) {
        self.shadow_params = shadows;
    }

    /// Export shadow weights as a plain safetensors file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if !self.is_initialized() {
            return Err(DepthError::Training(
                "EMA has no weights yet; run at least one training step".to_string(),
            ));
        }
        let tensors: Vec<(String, Tensor)> = self
            .shadow_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        write_safetensors(path, tensors, None)
    }
}
