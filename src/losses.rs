/// Depth regression losses
use candle_core::Tensor;

use crate::metrics::clamp_positive;
use crate::{DepthError, Result};

/// Maps `(prediction, target)` to a scalar loss tensor that can be backpropagated
pub trait Criterion: Send {
    fn loss(&self, preds: &Tensor, targets: &Tensor) -> Result<Tensor>;
}

impl<F> Criterion for F
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor> + Send,
{
    fn loss(&self, preds: &Tensor, targets: &Tensor) -> Result<Tensor> {
        self(preds, targets)
    }
}

/// Mean absolute error
#[derive(Debug, Clone, Copy, Default)]
pub struct L1Loss;

impl Criterion for L1Loss {
    fn loss(&self, preds: &Tensor, targets: &Tensor) -> Result<Tensor> {
        Ok((preds - targets)?.abs()?.mean_all()?)
    }
}

/// Mean squared error
#[derive(Debug, Clone, Copy, Default)]
pub struct MseLoss;

impl Criterion for MseLoss {
    fn loss(&self, preds: &Tensor, targets: &Tensor) -> Result<Tensor> {
        Ok(candle_nn::loss::mse(preds, targets)?)
    }
}

/// Scale-invariant log loss: `mean(d²) - λ·mean(d)²` with `d = ln p - ln t`
#[derive(Debug, Clone, Copy)]
pub struct SiLogLoss {
    pub lambda: f64,
}

impl Default for SiLogLoss {
    fn default() -> Self {
        Self { lambda: 0.85 }
    }
}

impl Criterion for SiLogLoss {
    fn loss(&self, preds: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let d = (clamp_positive(preds)?.log()? - clamp_positive(targets)?.log()?)?;
        let mean_sq = d.sqr()?.mean_all()?;
        let sq_mean = (d.mean_all()?.sqr()? * self.lambda)?;
        Ok((mean_sq - sq_mean)?.to_dtype(preds.dtype())?)
    }
}

/// Keys accepted by [`build_criterion`]
pub const LOSS_NAMES: [&str; 3] = ["l1", "mse", "silog"];

/// Construct a loss from its configuration key
pub fn build_criterion(name: &str) -> Result<Box<dyn Criterion>> {
    match name {
        "l1" => Ok(Box::new(L1Loss)),
        "mse" => Ok(Box::new(MseLoss)),
        "silog" => Ok(Box::new(SiLogLoss::default())),
        other => Err(DepthError::Config(format!(
            "Unknown loss: {}. Must be one of {:?}",
            other, LOSS_NAMES
        ))),
    }
}
