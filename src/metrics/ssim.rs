/// Structural similarity index
use candle_core::{DType, Tensor};

use super::{check_pair, sum_f64, Metric, RunningMean, DEPTH_FLOOR};
use crate::{DepthError, Result};

const K1: f64 = 0.01;
const K2: f64 = 0.03;

/// Mean SSIM over images, with a uniform sliding window
///
/// Inputs are `[B, C, H, W]`. The window is `window x window`, shrunk to the
/// image size when the image is smaller. Without a fixed `data_range` the
/// range of each batch (`max - min` over predictions and targets) is used.
#[derive(Debug, Clone)]
pub struct StructuralSimilarity {
    window: usize,
    data_range: Option<f64>,
    acc: RunningMean,
}

impl Default for StructuralSimilarity {
    fn default() -> Self {
        Self::new()
    }
}

impl StructuralSimilarity {
    pub fn new() -> Self {
        Self {
            window: 7,
            data_range: None,
            acc: RunningMean::new(),
        }
    }

    /// Fix the dynamic range used for the stabilising constants
    pub fn with_data_range(mut self, data_range: f64) -> Self {
        self.data_range = Some(data_range);
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    fn range_of(&self, x: &Tensor, y: &Tensor) -> Result<f64> {
        if let Some(range) = self.data_range {
            return Ok(range);
        }
        let spread = |t: &Tensor| -> Result<f64> {
            let hi = t.max_all()?.to_scalar::<f64>()?;
            let lo = t.min_all()?.to_scalar::<f64>()?;
            Ok(hi - lo)
        };
        Ok(spread(x)?.max(spread(y)?).max(DEPTH_FLOOR))
    }

    /// Per-image SSIM, shape `[B]`
    fn per_image(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        let k = self.window.min(h).min(w);
        let pool = |t: &Tensor| t.avg_pool2d_with_stride((k, k), (1, 1));

        let range = self.range_of(x, y)?;
        let c1 = (K1 * range).powi(2);
        let c2 = (K2 * range).powi(2);

        let mu_x = pool(x)?;
        let mu_y = pool(y)?;
        let mu_xx = mu_x.sqr()?;
        let mu_yy = mu_y.sqr()?;
        let mu_xy = (&mu_x * &mu_y)?;

        let var_x = (pool(&x.sqr()?)? - &mu_xx)?;
        let var_y = (pool(&y.sqr()?)? - &mu_yy)?;
        let cov = (pool(&(x * y)?)? - &mu_xy)?;

        let num = (((mu_xy * 2.0)? + c1)? * ((cov * 2.0)? + c2)?)?;
        let den = (((mu_xx + mu_yy)? + c1)? * ((var_x + var_y)? + c2)?)?;
        Ok((num / den)?.mean((1, 2, 3))?)
    }
}

impl Metric for StructuralSimilarity {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        check_pair(preds, targets)?;
        if preds.rank() != 4 {
            return Err(DepthError::Data(format!(
                "SSIM expects [B, C, H, W] inputs, got {:?}",
                preds.dims()
            )));
        }
        let x = preds.to_dtype(DType::F64)?.contiguous()?;
        let y = targets.to_dtype(DType::F64)?.contiguous()?;

        let scores = self.per_image(&x, &y)?;
        self.acc.add(sum_f64(&scores)?, scores.dim(0)? as f64);
        Ok(())
    }

    fn compute(&self) -> Result<f64> {
        self.acc
            .mean()
            .ok_or_else(|| DepthError::EmptyMetric("SSIM".to_string()))
    }

    fn reset(&mut self) {
        self.acc.reset();
    }
}
