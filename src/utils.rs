/// Utility functions shared across the pipeline
use std::fs::File;
use std::path::Path;

use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;

use crate::{DepthError, Result};

/// Calculate the number of parameters in a tensor
pub fn count_parameters(tensor: &Tensor) -> usize {
    tensor.dims().iter().product()
}

/// Total parameter count across a var map
pub fn count_varmap_parameters(varmap: &VarMap) -> usize {
    varmap
        .all_vars()
        .iter()
        .map(|v| count_parameters(v.as_tensor()))
        .sum()
}

/// Snapshot of a var map as `(name, var)` pairs sorted by name
///
/// The sort gives every consumer (optimizer, EMA, checkpoint) the same
/// parameter order regardless of hash map iteration order.
pub fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| DepthError::Training("parameter store lock poisoned".to_string()))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Parse a device string: `cpu`, `cuda`, `cuda:N` or `metal`
pub fn parse_device(device: &str) -> Result<Device> {
    let device = device.trim().to_lowercase();
    let unavailable = |e: candle_core::Error| DepthError::Device(format!("{}: {}", device, e));

    match device.as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(0).map_err(unavailable),
        "metal" => Device::new_metal(0).map_err(unavailable),
        other => match other.strip_prefix("cuda:") {
            Some(ordinal) => {
                let ordinal: usize = ordinal.parse().map_err(|_| {
                    DepthError::Config(format!("Invalid CUDA ordinal in device '{}'", other))
                })?;
                Device::new_cuda(ordinal).map_err(unavailable)
            }
            None => Err(DepthError::Config(format!(
                "Invalid device: {}. Must be 'cpu', 'cuda', 'cuda:N' or 'metal'",
                other
            ))),
        },
    }
}

/// Fail fast when a tensor lives on a different device than expected
pub fn ensure_device(tensor: &Tensor, device: &Device, what: &str) -> Result<()> {
    if tensor.device().same_device(device) {
        Ok(())
    } else {
        Err(DepthError::Device(format!(
            "{} is on {:?} but the trainer runs on {:?}",
            what,
            tensor.device(),
            device
        )))
    }
}

/// Write a file through a sibling temp file and an atomic rename
///
/// A crash mid-write leaves any previous file at `path` untouched. On Unix the
/// parent directory is synced after the rename so the new entry is durable.
pub fn write_atomically<P, F>(path: P, write: F) -> Result<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut File) -> Result<()>,
{
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    write(tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| DepthError::Io(e.error))?;

    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    Ok(())
}
