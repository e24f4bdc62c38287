/// Weighted running mean
use candle_core::Tensor;

use super::{sum_f64, Metric};
use crate::{DepthError, Result};

/// Sufficient statistics for a weighted mean: `sum / weight`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    sum: f64,
    weight: f64,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a pre-summed contribution and the weight it stands for
    pub fn add(&mut self, sum: f64, weight: f64) {
        self.sum += sum;
        self.weight += weight;
    }

    /// `None` until something with positive weight was added
    pub fn mean(&self) -> Option<f64> {
        if self.weight > 0.0 {
            Some(self.sum / self.weight)
        } else {
            None
        }
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Mean of a stream of scalars, each weighted by the batch size it summarises
///
/// As a [`Metric`] it averages every element of `preds` (targets are ignored).
/// The trainer's loss meter uses [`update_value`](Self::update_value) so a
/// short final batch counts for exactly its number of samples.
#[derive(Debug, Clone, Default)]
pub struct MeanMetric {
    acc: RunningMean,
}

impl MeanMetric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one already-reduced value observed over `weight` samples
    pub fn update_value(&mut self, value: f64, weight: usize) -> Result<()> {
        if weight == 0 {
            return Err(DepthError::Data("Mean update with zero weight".to_string()));
        }
        if !value.is_finite() {
            return Err(DepthError::Data(format!("Non-finite value: {}", value)));
        }
        self.acc.add(value * weight as f64, weight as f64);
        Ok(())
    }

    /// Total weight seen since the last reset
    pub fn count(&self) -> f64 {
        self.acc.weight()
    }
}

impl Metric for MeanMetric {
    fn update(&mut self, preds: &Tensor, _targets: &Tensor) -> Result<()> {
        let n = preds.elem_count();
        if n == 0 {
            return Err(DepthError::Data("Empty batch".to_string()));
        }
        self.acc.add(sum_f64(preds)?, n as f64);
        Ok(())
    }

    fn compute(&self) -> Result<f64> {
        self.acc
            .mean()
            .ok_or_else(|| DepthError::EmptyMetric("mean".to_string()))
    }

    fn reset(&mut self) {
        self.acc.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_size_weighted_average() -> Result<()> {
        let mut meter = MeanMetric::new();
        meter.update_value(1.0, 4)?;
        meter.update_value(2.0, 4)?;
        // Partial final batch
        meter.update_value(4.0, 2)?;

        let expected = (1.0 * 4.0 + 2.0 * 4.0 + 4.0 * 2.0) / 10.0;
        assert!((meter.compute()? - expected).abs() < 1e-12);
        assert_eq!(meter.count(), 10.0);
        Ok(())
    }

    #[test]
    fn test_compute_does_not_mutate() -> Result<()> {
        let mut meter = MeanMetric::new();
        meter.update_value(3.0, 2)?;
        let first = meter.compute()?;
        let second = meter.compute()?;
        assert_eq!(first, second);
        assert_eq!(meter.count(), 2.0);
        Ok(())
    }

    #[test]
    fn test_empty_meter_signals_no_data() -> Result<()> {
        let mut meter = MeanMetric::new();
        assert!(matches!(meter.compute(), Err(DepthError::EmptyMetric(_))));

        meter.update_value(5.0, 1)?;
        meter.reset();
        assert!(matches!(meter.compute(), Err(DepthError::EmptyMetric(_))));
        Ok(())
    }

    #[test]
    fn test_rejects_zero_weight_and_nan() {
        let mut meter = MeanMetric::new();
        assert!(meter.update_value(1.0, 0).is_err());
        assert!(meter.update_value(f64::NAN, 3).is_err());
        assert_eq!(meter.count(), 0.0);
    }

    #[test]
    fn test_tensor_update_averages_elements() -> Result<()> {
        let device = Device::Cpu;
        let mut meter = MeanMetric::new();
        let a = Tensor::new(&[1.0f32, 3.0], &device)?;
        let b = Tensor::new(&[5.0f32, 7.0, 9.0, 11.0], &device)?;
        meter.update(&a, &a)?;
        meter.update(&b, &b)?;
        assert!((meter.compute()? - 6.0).abs() < 1e-12);
        Ok(())
    }
}
