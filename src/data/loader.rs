/// In-memory depth dataset and batching loader
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{Batch, BatchStream};
use crate::{DepthError, Result};

/// Paired RGB/depth samples held on the host
#[derive(Debug, Clone)]
pub struct DepthDataset {
    images: Tensor, // [N, C, H, W]
    depths: Tensor, // [N, 1, H, W]
    ids: Vec<String>,
}

impl DepthDataset {
    /// Create from image and depth tensors
    ///
    /// Depths may be `[N, H, W]` (a channel axis is added) or `[N, 1, H, W]`.
    /// Both tensors are cast to f32, made contiguous and kept on the CPU.
    pub fn new(images: Tensor, depths: Tensor, ids: Vec<String>) -> Result<Self> {
        let images = images
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .contiguous()?;
        let depths = depths
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .contiguous()?;
        let depths = match depths.rank() {
            3 => depths.unsqueeze(1)?.contiguous()?,
            4 => depths,
            r => {
                return Err(DepthError::Data(format!(
                    "depths must be rank 3 or 4, got rank {}",
                    r
                )))
            }
        };

        let (n, _, h, w) = images.dims4()?;
        let (dn, dc, dh, dw) = depths.dims4()?;
        if dn != n || dc != 1 || dh != h || dw != w {
            return Err(DepthError::Data(format!(
                "Shape mismatch: images {:?} vs depths {:?}",
                images.dims(),
                depths.dims()
            )));
        }
        if ids.len() != n {
            return Err(DepthError::Data(format!(
                "Expected {} identifiers, got {}",
                n,
                ids.len()
            )));
        }

        Ok(Self { images, depths, ids })
    }

    /// Create with generated identifiers `sample_000000`, `sample_000001`, ...
    pub fn with_default_ids(images: Tensor, depths: Tensor) -> Result<Self> {
        let n = images.dim(0)?;
        let ids = (0..n).map(|i| format!("sample_{:06}", i)).collect();
        Self::new(images, depths, ids)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Gather the samples at `indices` into one batch on `device`
    fn gather(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, indices.len(), &Device::Cpu)?;

        let image = self.images.index_select(&idx, 0)?.to_device(device)?;
        let target = self.depths.index_select(&idx, 0)?.to_device(device)?;
        let ids = indices.iter().map(|&i| self.ids[i].clone()).collect();

        Ok(Batch { image, target, ids })
    }
}

/// Batching loader over a [`DepthDataset`]
///
/// The last batch is kept even when it is shorter than `batch_size`.
pub struct DepthDataLoader {
    dataset: DepthDataset,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    indices: Vec<usize>,
    current_idx: usize,
}

impl DepthDataLoader {
    /// Create new data loader; `seed` makes shuffling reproducible
    pub fn new(dataset: DepthDataset, batch_size: usize, shuffle: bool, seed: Option<u64>) -> Result<Self> {
        if batch_size == 0 {
            return Err(DepthError::Config("batch_size must be > 0".to_string()));
        }

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let indices = (0..dataset.len()).collect();

        let mut loader = Self {
            dataset,
            batch_size,
            shuffle,
            rng,
            indices,
            current_idx: 0,
        };
        loader.reset();
        Ok(loader)
    }

    pub fn dataset(&self) -> &DepthDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl BatchStream for DepthDataLoader {
    fn next_batch(&mut self, device: &Device) -> Result<Option<Batch>> {
        if self.current_idx >= self.indices.len() {
            return Ok(None);
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch = self
            .dataset
            .gather(&self.indices[self.current_idx..end_idx], device)?;
        self.current_idx = end_idx;

        Ok(Some(batch))
    }

    fn reset(&mut self) {
        self.current_idx = 0;
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(n: usize) -> Result<DepthDataset> {
        let device = Device::Cpu;
        let images = Tensor::randn(0f32, 1.0, (n, 3, 4, 4), &device)?;
        let depths = Tensor::rand(0.5f32, 10.0, (n, 4, 4), &device)?;
        DepthDataset::with_default_ids(images, depths)
    }

    #[test]
    fn test_partial_last_batch() -> Result<()> {
        let mut loader = DepthDataLoader::new(dataset(5)?, 2, false, None)?;
        assert_eq!(loader.num_batches(), 3);

        let mut sizes = Vec::new();
        while let Some(batch) = loader.next_batch(&Device::Cpu)? {
            assert_eq!(&batch.target.dims()[1..], &[1, 4, 4]);
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        Ok(())
    }

    #[test]
    fn test_ids_pass_through_in_order() -> Result<()> {
        let mut loader = DepthDataLoader::new(dataset(3)?, 3, false, None)?;
        let batch = loader.next_batch(&Device::Cpu)?.unwrap();
        assert_eq!(batch.ids, vec!["sample_000000", "sample_000001", "sample_000002"]);
        Ok(())
    }

    #[test]
    fn test_reset_restarts_epoch() -> Result<()> {
        let mut loader = DepthDataLoader::new(dataset(4)?, 4, true, Some(7))?;
        assert!(loader.next_batch(&Device::Cpu)?.is_some());
        assert!(loader.next_batch(&Device::Cpu)?.is_none());

        loader.reset();
        let batch = loader.next_batch(&Device::Cpu)?.unwrap();
        let mut ids = batch.ids.clone();
        ids.sort();
        assert_eq!(ids, loader.dataset().ids().to_vec());
        Ok(())
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible() -> Result<()> {
        let data = dataset(16)?;
        let mut a = DepthDataLoader::new(data.clone(), 16, true, Some(42))?;
        let mut b = DepthDataLoader::new(data, 16, true, Some(42))?;
        let ids_a = a.next_batch(&Device::Cpu)?.unwrap().ids;
        let ids_b = b.next_batch(&Device::Cpu)?.unwrap().ids;
        assert_eq!(ids_a, ids_b);
        Ok(())
    }

    #[test]
    fn test_strided_inputs_are_batched() -> Result<()> {
        let device = Device::Cpu;
        // Broadcast depths and transposed images are both non-contiguous
        let images = Tensor::rand(0f32, 1.0, (3, 3, 4, 4), &device)?.transpose(2, 3)?;
        let depths = Tensor::full(2.5f32, (3, 4, 4), &device)?;
        assert!(!depths.is_contiguous());

        let data = DepthDataset::with_default_ids(images, depths)?;
        let mut loader = DepthDataLoader::new(data, 2, true, Some(3))?;
        let mut seen = 0;
        while let Some(batch) = loader.next_batch(&device)? {
            let values = batch.target.flatten_all()?.to_vec1::<f32>()?;
            assert!(values.iter().all(|&v| v == 2.5));
            seen += batch.len();
        }
        assert_eq!(seen, 3);
        Ok(())
    }

    #[test]
    fn test_mismatched_depths_rejected() -> Result<()> {
        let device = Device::Cpu;
        let images = Tensor::zeros((2, 3, 4, 4), DType::F32, &device)?;
        let depths = Tensor::zeros((2, 4, 5), DType::F32, &device)?;
        assert!(matches!(
            DepthDataset::with_default_ids(images, depths),
            Err(DepthError::Data(_))
        ));
        Ok(())
    }
}
