/// Delta (threshold) accuracy
use candle_core::Tensor;

use super::{check_pair, clamp_positive, sum_f64, Metric, RunningMean};
use crate::{DepthError, Result};

/// Fraction of elements with `max(p/t, t/p) < threshold`
///
/// Standard thresholds are 1.25, 1.25² and 1.25³.
#[derive(Debug, Clone)]
pub struct ThresholdAccuracy {
    threshold: f64,
    acc: RunningMean,
}

impl ThresholdAccuracy {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            acc: RunningMean::new(),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl Metric for ThresholdAccuracy {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        let n = check_pair(preds, targets)?;
        let p = clamp_positive(preds)?;
        let t = clamp_positive(targets)?;

        let ratio = (&p / &t)?.maximum(&(&t / &p)?)?;
        let within = ratio.lt(self.threshold)?;
        self.acc.add(sum_f64(&within)?, n as f64);
        Ok(())
    }

    fn compute(&self) -> Result<f64> {
        self.acc
            .mean()
            .ok_or_else(|| DepthError::EmptyMetric(format!("delta<{}", self.threshold)))
    }

    fn reset(&mut self) {
        self.acc.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_equal_predictions_are_fully_accurate() -> Result<()> {
        let t = Tensor::new(&[0.7f32, 1.0, 3.0, 9.0], &Device::Cpu)?;
        let mut metric = ThresholdAccuracy::new(1.25);
        metric.update(&t, &t)?;
        assert_eq!(metric.compute()?, 1.0);
        Ok(())
    }

    #[test]
    fn test_double_predictions_miss_first_threshold() -> Result<()> {
        let device = Device::Cpu;
        let target = Tensor::new(&[0.7f32, 1.0, 3.0, 9.0], &device)?;
        let preds = (&target * 2.0)?;

        let mut metric = ThresholdAccuracy::new(1.25);
        metric.update(&preds, &target)?;
        assert_eq!(metric.compute()?, 0.0);

        // 1.25³ is still below 2
        let mut ta3 = ThresholdAccuracy::new(1.25f64.powi(3));
        ta3.update(&preds, &target)?;
        assert_eq!(ta3.compute()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_partial_accuracy() -> Result<()> {
        let device = Device::Cpu;
        let target = Tensor::ones(4, DType::F32, &device)?;
        let preds = Tensor::new(&[1.0f32, 1.1, 0.5, 3.0], &device)?;

        let mut metric = ThresholdAccuracy::new(1.25);
        metric.update(&preds, &target)?;
        assert_eq!(metric.compute()?, 0.5);
        Ok(())
    }

    #[test]
    fn test_reset_clears_state() -> Result<()> {
        let t = Tensor::ones(2, DType::F32, &Device::Cpu)?;
        let mut metric = ThresholdAccuracy::new(1.25);
        metric.update(&t, &t)?;
        metric.reset();
        assert!(matches!(metric.compute(), Err(DepthError::EmptyMetric(_))));
        assert_eq!(metric.threshold(), 1.25);
        Ok(())
    }
}
