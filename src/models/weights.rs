//! Checkpoint loading
//!
//! Jukebox checkpoints ship as PyTorch zip pickles with the state dict under
//! `"model"`; converted `.safetensors` files are read directly. Tensors are
//! filtered by name before they are materialized, so a truncated prior never
//! loads the layers it drops, and every float tensor is widened to F32.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::Path;

use crate::error::EmbedError;

/// Named tensors from a checkpoint
pub type Weights = HashMap<String, Tensor>;

/// Load every tensor from a checkpoint
pub fn load_checkpoint(path: &Path, device: &Device) -> Result<Weights> {
    load_checkpoint_filtered(path, device, |_| true)
}

/// Load the tensors whose (prefix-stripped) name passes `keep`
pub fn load_checkpoint_filtered<F>(path: &Path, device: &Device, keep: F) -> Result<Weights>
where
    F: Fn(&str) -> bool,
{
    let loaded = if is_safetensors(path) {
        load_safetensors(path, device, &keep)
    } else {
        load_pth(path, device, &keep)
    };
    let weights = loaded.map_err(|e| EmbedError::resource_load("checkpoint", path, e))?;
    tracing::debug!("Loaded {} tensors from {}", weights.len(), path.display());
    Ok(weights)
}

fn is_safetensors(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "safetensors")
}

fn load_safetensors<F>(path: &Path, device: &Device, keep: &F) -> Result<Weights>
where
    F: Fn(&str) -> bool,
{
    // SAFETY: the file is treated as read-only for the lifetime of the mapping
    let st = unsafe { candle_core::safetensors::MmapedSafetensors::new(path)? };
    let mut weights = HashMap::new();
    for (name, _) in st.tensors() {
        let key = strip_module_prefix(&name);
        if !keep(key) {
            continue;
        }
        let tensor = st
            .load(&name, device)
            .with_context(|| format!("Failed to read tensor {}", name))?;
        weights.insert(key.to_string(), to_f32(tensor)?);
    }
    Ok(weights)
}

fn load_pth<F>(path: &Path, device: &Device, keep: &F) -> Result<Weights>
where
    F: Fn(&str) -> bool,
{
    let pth = candle_core::pickle::PthTensors::new(path, Some("model"))
        .with_context(|| format!("Failed to open PyTorch checkpoint {}", path.display()))?;
    let mut names: Vec<String> = pth.tensor_infos().keys().cloned().collect();
    names.sort();

    let mut weights = HashMap::new();
    for name in names {
        let key = strip_module_prefix(&name);
        if !keep(key) {
            continue;
        }
        let tensor = pth
            .get(&name)?
            .ok_or_else(|| anyhow::anyhow!("Tensor {} listed but not readable", name))?;
        weights.insert(key.to_string(), to_f32(tensor)?.to_device(device)?);
    }
    Ok(weights)
}

/// Checkpoints saved from a data-parallel wrapper prefix every key with `module.`
pub fn strip_module_prefix(name: &str) -> &str {
    name.strip_prefix("module.").unwrap_or(name)
}

fn to_f32(tensor: Tensor) -> Result<Tensor> {
    Ok(match tensor.dtype() {
        DType::BF16 | DType::F16 | DType::F64 => tensor.to_dtype(DType::F32)?,
        _ => tensor,
    })
}

/// Fetch a tensor by name
pub fn get(weights: &Weights, name: &str) -> Result<Tensor> {
    weights
        .get(name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Missing weight: {}", name))
}

/// Layer index of a `<prefix><index>.` key
pub fn layer_index(name: &str, prefix: &str) -> Option<usize> {
    let rest = name.strip_prefix(prefix)?;
    rest.split('.').next()?.parse().ok()
}
