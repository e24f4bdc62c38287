/// Depth-estimation metrics as running accumulators
///
/// Every metric folds `(prediction, target)` batch pairs into running
/// sufficient statistics. `compute()` never mutates state and returns
/// [`DepthError::EmptyMetric`] until at least one element has been seen.
/// `reset()` returns the accumulator to its zero state.
use candle_core::{DType, Tensor};

use crate::{DepthError, Result};

pub mod error;
pub mod log10;
pub mod mean;
pub mod ssim;
pub mod threshold;

pub use error::{MeanAbsolutePercentageError, RootMeanSquaredError};
pub use log10::Log10AverageError;
pub use mean::{MeanMetric, RunningMean};
pub use ssim::StructuralSimilarity;
pub use threshold::ThresholdAccuracy;

/// Positive floor applied to depth values before any log or ratio
pub const DEPTH_FLOOR: f64 = 1e-6;

/// Clamp a depth tensor to `DEPTH_FLOOR` in f64
///
/// Zero and negative depths are silently floored. All log and ratio
/// metrics (and the log-space loss) go through this one function.
pub fn clamp_positive(t: &Tensor) -> Result<Tensor> {
    Ok(t.to_dtype(DType::F64)?.maximum(DEPTH_FLOOR)?)
}

/// Reject empty batches and prediction/target shape mismatches
pub fn check_pair(preds: &Tensor, targets: &Tensor) -> Result<usize> {
    if preds.dims() != targets.dims() {
        return Err(DepthError::Data(format!(
            "Shape mismatch: predictions {:?} != targets {:?}",
            preds.dims(),
            targets.dims()
        )));
    }
    let n = preds.elem_count();
    if n == 0 {
        return Err(DepthError::Data("Empty batch".to_string()));
    }
    Ok(n)
}

/// Sum all elements of a tensor into a host f64
pub(crate) fn sum_f64(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?)
}

/// Running aggregate of a scalar statistic over batch pairs
pub trait Metric: Send {
    /// Fold one batch into the running state
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()>;

    /// Current aggregate; errors when nothing was observed yet
    fn compute(&self) -> Result<f64>;

    /// Clear state back to zero
    fn reset(&mut self);
}

/// Keys accepted by [`build_metric`]
pub const METRIC_NAMES: [&str; 7] = ["Log10AE", "MAPE", "RMSE", "SSIM", "TA1", "TA2", "TA3"];

/// Construct a metric from its configuration key
pub fn build_metric(name: &str) -> Result<Box<dyn Metric>> {
    let metric: Box<dyn Metric> = match name {
        "Log10AE" => Box::new(Log10AverageError::new()),
        "MAPE" => Box::new(MeanAbsolutePercentageError::new()),
        "RMSE" => Box::new(RootMeanSquaredError::new()),
        "SSIM" => Box::new(StructuralSimilarity::new()),
        "TA1" => Box::new(ThresholdAccuracy::new(1.25)),
        "TA2" => Box::new(ThresholdAccuracy::new(1.25f64.powi(2))),
        "TA3" => Box::new(ThresholdAccuracy::new(1.25f64.powi(3))),
        other => {
            return Err(DepthError::Config(format!(
                "Unknown metric: {}. Must be one of {:?}",
                other, METRIC_NAMES
            )))
        }
    };
    Ok(metric)
}

/// Named, ordered collection of metrics updated together
#[derive(Default)]
pub struct MetricCollection {
    metrics: Vec<(String, Box<dyn Metric>)>,
}

impl MetricCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard depth metrics: Log10AE, MAPE, RMSE, SSIM and the three delta accuracies
    pub fn depth_default() -> Self {
        let names: Vec<String> = METRIC_NAMES.iter().map(|s| s.to_string()).collect();
        // Every key comes from METRIC_NAMES, so construction cannot miss
        Self::from_names(&names).unwrap_or_default()
    }

    /// Build from registry keys, failing on the first unknown one
    pub fn from_names(names: &[String]) -> Result<Self> {
        let mut collection = Self::new();
        for name in names {
            collection.insert(name.clone(), build_metric(name)?)?;
        }
        Ok(collection)
    }

    /// Add a metric; names must be unique within the collection
    pub fn insert(&mut self, name: impl Into<String>, metric: Box<dyn Metric>) -> Result<()> {
        let name = name.into();
        if self.metrics.iter().any(|(n, _)| *n == name) {
            return Err(DepthError::Config(format!("Duplicate metric name: {}", name)));
        }
        self.metrics.push((name, metric));
        Ok(())
    }

    /// Builder-style variant of [`insert`](Self::insert)
    pub fn with(mut self, name: impl Into<String>, metric: Box<dyn Metric>) -> Result<Self> {
        self.insert(name, metric)?;
        Ok(self)
    }

    pub fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        for (_, metric) in self.metrics.iter_mut() {
            metric.update(preds, targets)?;
        }
        Ok(())
    }

    /// Compute every metric, keyed `<prefix><name>`, in insertion order
    pub fn compute(&self, prefix: &str) -> Result<Vec<(String, f64)>> {
        self.metrics
            .iter()
            .map(|(name, metric)| {
                let value = metric.compute().map_err(|e| match e {
                    DepthError::EmptyMetric(_) => DepthError::EmptyMetric(name.clone()),
                    other => other,
                })?;
                Ok((format!("{}{}", prefix, name), value))
            })
            .collect()
    }

    pub fn reset(&mut self) {
        for (_, metric) in self.metrics.iter_mut() {
            metric.reset();
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
