/// Mean absolute error in log10 space
use std::f64::consts::LN_10;

use candle_core::Tensor;

use super::{check_pair, clamp_positive, sum_f64, Metric, RunningMean};
use crate::{DepthError, Result};

/// `mean(|log10(pred) - log10(target)|)` over every element seen
///
/// Both sides are floored by [`clamp_positive`] first, so zero or negative
/// depths contribute a finite (large) error instead of `-inf`/NaN.
#[derive(Debug, Clone, Default)]
pub struct Log10AverageError {
    acc: RunningMean,
}

impl Log10AverageError {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for Log10AverageError {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        let n = check_pair(preds, targets)?;
        let log_p = clamp_positive(preds)?.log()?;
        let log_t = clamp_positive(targets)?.log()?;
        let abs_log_err = (log_p - log_t)?.abs()?;
        self.acc.add(sum_f64(&abs_log_err)? / LN_10, n as f64);
        Ok(())
    }

    fn compute(&self) -> Result<f64> {
        self.acc
            .mean()
            .ok_or_else(|| DepthError::EmptyMetric("Log10AE".to_string()))
    }

    fn reset(&mut self) {
        self.acc.reset();
    }
}
