/// Linear-space error metrics
use candle_core::{DType, Tensor};

use super::{check_pair, clamp_positive, sum_f64, Metric, RunningMean};
use crate::{DepthError, Result};

/// `mean(|pred - target| / max(|target|, DEPTH_FLOOR))`
#[derive(Debug, Clone, Default)]
pub struct MeanAbsolutePercentageError {
    acc: RunningMean,
}

impl MeanAbsolutePercentageError {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for MeanAbsolutePercentageError {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        let n = check_pair(preds, targets)?;
        let p = preds.to_dtype(DType::F64)?;
        let t = targets.to_dtype(DType::F64)?;

        let denom = clamp_positive(&t.abs()?)?;
        let rel = ((p - &t)?.abs()? / denom)?;
        self.acc.add(sum_f64(&rel)?, n as f64);
        Ok(())
    }

    fn compute(&self) -> Result<f64> {
        self.acc
            .mean()
            .ok_or_else(|| DepthError::EmptyMetric("MAPE".to_string()))
    }

    fn reset(&mut self) {
        self.acc.reset();
    }
}

/// `sqrt(mean((pred - target)²))` over every element seen
#[derive(Debug, Clone, Default)]
pub struct RootMeanSquaredError {
    acc: RunningMean,
}

impl RootMeanSquaredError {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for RootMeanSquaredError {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        let n = check_pair(preds, targets)?;
        let diff = (preds.to_dtype(DType::F64)? - targets.to_dtype(DType::F64)?)?;
        self.acc.add(sum_f64(&diff.sqr()?)?, n as f64);
        Ok(())
    }

    fn compute(&self) -> Result<f64> {
        self.acc
            .mean()
            .map(f64::sqrt)
            .ok_or_else(|| DepthError::EmptyMetric("RMSE".to_string()))
    }

    fn reset(&mut self) {
        self.acc.reset();
    }
}
