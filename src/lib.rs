//! Monocular depth estimation - training pipeline
//!
//! Encoder-decoder depth networks trained on paired RGB/depth data with
//! exponential-moving-average weight tracking, depth-specific metrics and
//! resumable checkpoints, built on candle.
//!
//! # Architecture
//!
//! - **Trainer**: drives train/validate epochs, history and checkpoints
//! - **Metrics**: running accumulators (Log10AE, MAPE, RMSE, delta accuracy)
//! - **EMA**: shadow weights updated after every optimizer step
//! - **Registries**: model, loss and metric constructors keyed by name
//!
//! # Example
//!
//! ```ignore
//! use monodepth::training::{Trainer, TrainerBuilder};
//!
//! let mut trainer = TrainerBuilder::new(factory)
//!     .criterion(criterion)
//!     .metrics(metrics)
//!     .build(&device)?;
//! trainer.train(10, &mut train_loader, &mut val_loader, Some(&mut scheduler), 50, 2, "checkpoints")?;
//! ```

pub mod config;
pub mod data;
pub mod layers;
pub mod losses;
pub mod metrics;
pub mod models;
pub mod training;
pub mod utils;

// Re-export commonly used items
pub use config::TrainConfig;
pub use training::{Trainer, TrainerBuilder};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum DepthError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Metric '{0}' read before any update")]
    EmptyMetric(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, DepthError>;
