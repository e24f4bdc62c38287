/// Data loading for depth training
pub mod loader;
pub mod numpy_dataset;

pub use loader::{DepthDataLoader, DepthDataset};
pub use numpy_dataset::NpyDepthDataset;

use candle_core::{Device, Tensor};

use crate::Result;

/// One batch: images `[B, C, H, W]`, depth targets `[B, 1, H, W]`, sample identifiers
///
/// Identifiers (e.g. file names) are carried through untouched.
#[derive(Debug, Clone)]
pub struct Batch {
    pub image: Tensor,
    pub target: Tensor,
    pub ids: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Finite, restartable stream of batches
pub trait BatchStream {
    /// Next batch on `device`, or `None` at the end of the epoch
    fn next_batch(&mut self, device: &Device) -> Result<Option<Batch>>;

    /// Rewind for a new epoch
    fn reset(&mut self);

    /// Total number of batches per epoch
    fn num_batches(&self) -> usize;
}
