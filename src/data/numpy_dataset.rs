/// NumPy (.npy) loader for paired RGB/depth splits
use candle_core::{Device, Tensor};
use ndarray::ArrayD;
use ndarray_npy::ReadNpyExt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::DepthDataset;
use crate::{DepthError, Result};

/// One split directory of NumPy arrays
///
/// Expected layout:
/// - `images.npy`: f32 `[N, C, H, W]`
/// - `depths.npy`: f32 `[N, H, W]` or `[N, 1, H, W]`
/// - `ids.json` (optional): list of N sample identifiers
pub struct NpyDepthDataset;

impl NpyDepthDataset {
    /// Load a split directory into an in-memory [`DepthDataset`]
    pub fn from_directory<P: AsRef<Path>>(path: P) -> Result<DepthDataset> {
        let dir = path.as_ref();

        log::info!("Loading NumPy depth split from: {:?}", dir);

        let images = read_f32_array(&dir.join("images.npy"))?;
        log::info!("Loaded images: shape {:?}", images.dims());

        let depths = read_f32_array(&dir.join("depths.npy"))?;
        log::info!("Loaded depths: shape {:?}", depths.dims());

        // Sample identifiers (optional)
        let ids_path = dir.join("ids.json");
        let dataset = if ids_path.exists() {
            let reader = BufReader::new(File::open(&ids_path)?);
            let ids: Vec<String> = serde_json::from_reader(reader)?;
            DepthDataset::new(images, depths, ids)?
        } else {
            log::warn!("ids.json not found, using generated identifiers");
            DepthDataset::with_default_ids(images, depths)?
        };

        log::info!("Split loaded: {} samples", dataset.len());
        Ok(dataset)
    }
}

/// Read an f32 `.npy` file of any rank into a CPU tensor
fn read_f32_array(path: &Path) -> Result<Tensor> {
    let file = File::open(path).map_err(|e| {
        DepthError::Data(format!("Failed to open {}: {}", path.display(), e))
    })?;
    let array = <ArrayD<f32> as ReadNpyExt>::read_npy(file).map_err(|e| {
        DepthError::Data(format!("Failed to read {}: {}", path.display(), e))
    })?;

    let shape = array.shape().to_vec();
    let data: Vec<f32> = array.iter().copied().collect();
    Ok(Tensor::from_vec(data, shape, &Device::Cpu)?)
}
