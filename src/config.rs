/// Training run configuration
///
/// Loaded from JSON and validated before any training resource is allocated.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::losses::LOSS_NAMES;
use crate::metrics::METRIC_NAMES;
use crate::models::MODEL_NAMES;
use crate::{DepthError, Result};

/// Model architecture selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Registry key: "tiny_unet" or "pixel_linear"
    pub name: String,

    /// Input image channels
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,

    /// Width of the first encoder stage (doubles per level)
    #[serde(default = "default_base_channels")]
    pub base_channels: usize,

    /// Dropout probability in the bottleneck
    #[serde(default)]
    pub dropout: f32,
}

fn default_in_channels() -> usize {
    3
}

fn default_base_channels() -> usize {
    16
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "tiny_unet".to_string(),
            in_channels: default_in_channels(),
            base_channels: default_base_channels(),
            dropout: 0.0,
        }
    }
}

/// Epoch-level learning-rate schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SchedulerConfig {
    /// Fixed learning rate
    Constant,
    /// Multiply by `gamma` every `step_size` epochs
    Step { step_size: usize, gamma: f64 },
    /// Linear warmup then cosine annealing to `lr_min`
    Cosine {
        lr_min: f64,
        warmup_epochs: usize,
        total_epochs: usize,
    },
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig::Step {
            step_size: 5,
            gamma: 0.1,
        }
    }
}

/// Full training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Root directory holding one sub-directory per split
    pub dataset_path: String,
    pub train_split: String,
    pub val_split: String,

    pub model: ModelConfig,
    /// Loss registry key
    pub loss: String,
    /// Metric registry keys, reported in this order
    pub metrics: Vec<String>,

    pub num_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// EMA shadow weight in [0, 1)
    pub ema_weight: f64,
    pub scheduler: SchedulerConfig,

    /// "cpu", "cuda", "cuda:N" or "metal"
    pub device: String,
    pub checkpoints_dir: String,
    /// Periodic checkpoint interval in epochs (0 disables)
    pub save_checkpoint_per_num_epochs: usize,
    /// Progress line every N batches (0 disables)
    pub verbose: usize,
    pub random_seed: Option<u64>,
    pub shuffle: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset_path: "data/nyu_depth_v2".to_string(),
            train_split: "train".to_string(),
            val_split: "val".to_string(),
            model: ModelConfig::default(),
            loss: "l1".to_string(),
            metrics: METRIC_NAMES.iter().map(|s| s.to_string()).collect(),
            num_epochs: 20,
            batch_size: 8,
            learning_rate: 1e-4,
            weight_decay: 1e-4,
            ema_weight: 0.99,
            scheduler: SchedulerConfig::default(),
            device: "cpu".to_string(),
            checkpoints_dir: "checkpoints".to_string(),
            save_checkpoint_per_num_epochs: 5,
            verbose: 50,
            random_seed: None,
            shuffle: true,
        }
    }
}

impl TrainConfig {
    /// Load configuration from a JSON file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DepthError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: TrainConfig = serde_json::from_str(&content)
            .map_err(|e| DepthError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let model = self.model.name.to_lowercase();
        if !MODEL_NAMES.contains(&model.as_str()) {
            return Err(DepthError::Config(format!(
                "Invalid model name: {}. Must be one of {:?}",
                self.model.name, MODEL_NAMES
            )));
        }

        if self.model.in_channels == 0 || self.model.base_channels == 0 {
            return Err(DepthError::Config(
                "in_channels and base_channels must be > 0".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(DepthError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.model.dropout
            )));
        }

        if !LOSS_NAMES.contains(&self.loss.as_str()) {
            return Err(DepthError::Config(format!(
                "Invalid loss: {}. Must be one of {:?}",
                self.loss, LOSS_NAMES
            )));
        }

        for metric in &self.metrics {
            if !METRIC_NAMES.contains(&metric.as_str()) {
                return Err(DepthError::Config(format!(
                    "Invalid metric: {}. Must be one of {:?}",
                    metric, METRIC_NAMES
                )));
            }
        }

        if self.batch_size == 0 {
            return Err(DepthError::Config("batch_size must be > 0".to_string()));
        }

        if !(self.learning_rate > 0.0) {
            return Err(DepthError::Config(format!(
                "learning_rate must be > 0, got {}",
                self.learning_rate
            )));
        }

        if self.weight_decay < 0.0 {
            return Err(DepthError::Config(format!(
                "weight_decay must be >= 0, got {}",
                self.weight_decay
            )));
        }

        if !(0.0..1.0).contains(&self.ema_weight) {
            return Err(DepthError::Config(format!(
                "ema_weight must be in [0, 1), got {}",
                self.ema_weight
            )));
        }

        match &self.scheduler {
            SchedulerConfig::Step { step_size: 0, .. } => {
                return Err(DepthError::Config("scheduler step_size must be > 0".to_string()))
            }
            SchedulerConfig::Cosine {
                warmup_epochs,
                total_epochs,
                ..
            } if warmup_epochs >= total_epochs => {
                return Err(DepthError::Config(
                    "scheduler warmup_epochs must be < total_epochs".to_string(),
                ))
            }
            _ => {}
        }

        let device = self.device.trim().to_lowercase();
        let cuda_ordinal_ok = device
            .strip_prefix("cuda:")
            .map(|n| n.parse::<usize>().is_ok())
            .unwrap_or(false);
        if !(device == "cpu" || device == "cuda" || device == "metal" || cuda_ordinal_ok) {
            return Err(DepthError::Config(format!(
                "Invalid device: {}. Must be 'cpu', 'cuda', 'cuda:N' or 'metal'",
                self.device
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn test_unknown_names_rejected() {
        let mut config = TrainConfig::default();
        config.model.name = "dense_fpn".to_string();
        assert!(matches!(config.validate(), Err(DepthError::Config(_))));

        let mut config = TrainConfig::default();
        config.loss = "multiscale".to_string();
        assert!(matches!(config.validate(), Err(DepthError::Config(_))));

        let mut config = TrainConfig::default();
        config.metrics.push("EdgeF1_025".to_string());
        assert!(matches!(config.validate(), Err(DepthError::Config(_))));
    }

    #[test]
    fn test_numeric_ranges() {
        let mut config = TrainConfig::default();
        config.ema_weight = 1.0;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.learning_rate = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.scheduler = SchedulerConfig::Step {
            step_size: 0,
            gamma: 0.5,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_strings() {
        let mut config = TrainConfig::default();
        config.device = "cuda:1".to_string();
        assert!(config.validate().is_ok());
        config.device = "gpu".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_with_defaults() {
        let json = r#"{
            "dataset_path": "/data/nyu",
            "model": { "name": "pixel_linear" },
            "num_epochs": 3,
            "scheduler": { "kind": "cosine", "lr_min": 1e-6, "warmup_epochs": 1, "total_epochs": 3 }
        }"#;

        let config: TrainConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.model.base_channels, 16);
        assert_eq!(config.num_epochs, 3);
        assert_eq!(config.batch_size, 8);
        assert!(matches!(config.scheduler, SchedulerConfig::Cosine { .. }));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_load_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("train.json");
        let config = TrainConfig {
            num_epochs: 7,
            ..Default::default()
        };
        config.save(&path)?;
        assert_eq!(TrainConfig::load(&path)?, config);
        Ok(())
    }
}
