/// Training checkpoints with safetensors
///
/// A checkpoint is one safetensors file holding the model parameters and the
/// optimizer moments as tensors, with the optimizer scalars and the history
/// table stored as JSON in the header metadata.
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

use candle_core::{Device, Tensor};
use safetensors::tensor::SafeTensors;

use super::history::{EpochRecord, History};
use super::optimizer::{OptimizerScalars, OptimizerState, ParamMoments};
use crate::utils::write_atomically;
use crate::{DepthError, Result};

pub const CHECKPOINT_FORMAT: &str = "monodepth-checkpoint-v1";

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";
const EXP_AVG: &str = ".exp_avg";
const EXP_AVG_SQ: &str = ".exp_avg_sq";

/// Snapshot of a trainer: model parameters, optimizer state, history
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub model: BTreeMap<String, Tensor>,
    pub optimizer: OptimizerState,
    pub history: History,
}

impl Checkpoint {
    /// Save checkpoint to file
    ///
    /// The file is replaced atomically; a failed save leaves any previous
    /// checkpoint at `path` intact.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors = Vec::with_capacity(self.model.len() + 2 * self.optimizer.moments.len());
        for (name, tensor) in &self.model {
            tensors.push((format!("{}{}", MODEL_PREFIX, name), tensor.clone()));
        }
        for (name, moments) in &self.optimizer.moments {
            tensors.push((
                format!("{}{}{}", OPTIMIZER_PREFIX, name, EXP_AVG),
                moments.exp_avg.clone(),
            ));
            tensors.push((
                format!("{}{}{}", OPTIMIZER_PREFIX, name, EXP_AVG_SQ),
                moments.exp_avg_sq.clone(),
            ));
        }

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), CHECKPOINT_FORMAT.to_string());
        metadata.insert(
            "optimizer".to_string(),
            serde_json::to_string(&self.optimizer.scalars)?,
        );
        metadata.insert(
            "history".to_string(),
            serde_json::to_string(self.history.records())?,
        );

        write_safetensors(path.as_ref(), tensors, Some(metadata))?;
        log::info!("Saved checkpoint to {:?}", path.as_ref());
        Ok(())
    }

    /// Load checkpoint from file, placing tensors on `device`
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;

        let (_, header) = SafeTensors::read_metadata(&bytes)?;
        let metadata = header.metadata().as_ref().ok_or_else(|| {
            DepthError::Checkpoint(format!("{} has no checkpoint metadata", path.display()))
        })?;
        let field = |key: &str| {
            metadata.get(key).ok_or_else(|| {
                DepthError::Checkpoint(format!("{} is missing field '{}'", path.display(), key))
            })
        };

        let format = field("format")?;
        if format != CHECKPOINT_FORMAT {
            return Err(DepthError::Checkpoint(format!(
                "unsupported checkpoint format '{}'",
                format
            )));
        }
        let scalars: OptimizerScalars = serde_json::from_str(field("optimizer")?)?;
        let records: Vec<EpochRecord> = serde_json::from_str(field("history")?)?;
        let history = History::from_records(records)?;

        let mut model = BTreeMap::new();
        let mut exp_avg = BTreeMap::new();
        let mut exp_avg_sq = BTreeMap::new();
        for (key, tensor) in candle_core::safetensors::load_buffer(&bytes, device)? {
            if let Some(name) = key.strip_prefix(MODEL_PREFIX) {
                model.insert(name.to_string(), tensor);
            } else if let Some(rest) = key.strip_prefix(OPTIMIZER_PREFIX) {
                if let Some(name) = rest.strip_suffix(EXP_AVG_SQ) {
                    exp_avg_sq.insert(name.to_string(), tensor);
                } else if let Some(name) = rest.strip_suffix(EXP_AVG) {
                    exp_avg.insert(name.to_string(), tensor);
                } else {
                    return Err(DepthError::Checkpoint(format!("unexpected tensor '{}'", key)));
                }
            } else {
                return Err(DepthError::Checkpoint(format!("unexpected tensor '{}'", key)));
            }
        }

        let mut moments = BTreeMap::new();
        for (name, avg) in exp_avg {
            let avg_sq = exp_avg_sq.remove(&name).ok_or_else(|| {
                DepthError::Checkpoint(format!("'{}' has exp_avg but no exp_avg_sq", name))
            })?;
            moments.insert(
                name,
                ParamMoments {
                    exp_avg: avg,
                    exp_avg_sq: avg_sq,
                },
            );
        }
        if let Some(name) = exp_avg_sq.keys().next() {
            return Err(DepthError::Checkpoint(format!(
                "'{}' has exp_avg_sq but no exp_avg",
                name
            )));
        }

        log::info!(
            "Loaded checkpoint from {:?}: {} parameters, {} epochs",
            path,
            model.len(),
            history.len()
        );

        Ok(Self {
            model,
            optimizer: OptimizerState { scalars, moments },
            history,
        })
    }
}

/// Serialize named tensors to a safetensors file, atomically
pub(crate) fn write_safetensors<P: AsRef<Path>>(
    path: P,
    tensors: Vec<(String, Tensor)>,
    metadata: Option<HashMap<String, String>>,
) -> Result<()> {
    let tensors = tensors
        .into_iter()
        .map(|(name, t)| Ok((name, t.to_device(&Device::Cpu)?)))
        .collect::<Result<Vec<_>>>()?;
    let bytes = safetensors::serialize(tensors, &metadata)?;

    write_atomically(path, |file| {
        file.write_all(&bytes)?;
        Ok(())
    })
}
