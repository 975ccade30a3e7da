//! LoRA weight merger
//!
//! Folds adapter deltas into the base weight map before the network is built:
//! `W_new = W_base + scale * (B @ A)`. Replacement tensors saved with the
//! adapter overwrite their base weight.

use crate::apply::adapter::LoraAdapter;
use crate::device;
use crate::error::{Error, Result};
use candle_core::{DType, Tensor};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Outcome of a merge pass
#[derive(Debug, Default)]
pub struct MergeReport {
    pub merged: usize,
    /// Base weights overwritten by adapter tensors
    pub replaced: usize,
    pub skipped: Vec<String>,
}

/// Base weight name for an adapter module path
pub fn base_weight_key(module: &str) -> String {
    format!("{}.weight", module)
}

/// Merge every adapter module into `weights` in place
pub fn merge_lora_weights(
    weights: &mut HashMap<String, Tensor>,
    adapter: &LoraAdapter,
) -> Result<MergeReport> {
    info!(
        "Merging {} LoRA modules and {} replacement tensors into base weights",
        adapter.modules.len(),
        adapter.replacements.len()
    );

    let mut report = MergeReport::default();

    for (key, tensor) in &adapter.replacements {
        let Some(base) = weights.get(key) else {
            warn!("Skipped replacement {}: base model has no such weight", key);
            report.skipped.push(key.clone());
            continue;
        };
        if tensor.dims() != base.dims() {
            return Err(Error::Merge(format!(
                "shape mismatch for {}: base {:?}, adapter replacement {:?}",
                key,
                base.dims(),
                tensor.dims()
            )));
        }

        let replacement = device::place(tensor.to_dtype(base.dtype())?, base.device())?;
        weights.insert(key.clone(), replacement);
        report.replaced += 1;
        debug!("Replaced {}", key);
    }

    for (module, lora) in &adapter.modules {
        let key = base_weight_key(module);
        let Some(base) = weights.get(&key) else {
            warn!("Skipped module {}: no base weight named {}", module, key);
            report.skipped.push(module.clone());
            continue;
        };

        let delta = lora_delta(&lora.a, &lora.b, lora.scale, adapter.config.fan_in_fan_out)?;
        if delta.dims() != base.dims() {
            return Err(Error::Merge(format!(
                "shape mismatch for {}: base {:?}, adapter delta {:?}",
                key,
                base.dims(),
                delta.dims()
            )));
        }

        let merged = merge_into(base, &delta)?;
        weights.insert(key, merged);
        report.merged += 1;
        debug!("Merged {}", module);
    }

    info!(
        "Merge complete: {} modules merged, {} weights replaced, {} skipped",
        report.merged,
        report.replaced,
        report.skipped.len()
    );

    if report.merged == 0 && report.replaced == 0 {
        return Err(Error::Merge(
            "no LoRA modules could be merged into the base model".to_string(),
        ));
    }

    Ok(report)
}

/// `scale * B @ A`, transposed for fan-in/fan-out storage
pub fn lora_delta(a: &Tensor, b: &Tensor, scale: f64, fan_in_fan_out: bool) -> Result<Tensor> {
    let a = a.to_dtype(DType::F32)?;
    let b = b.to_dtype(DType::F32)?;
    let delta = b.matmul(&a)?.affine(scale, 0.0)?;
    if fan_in_fan_out {
        Ok(delta.t()?.contiguous()?)
    } else {
        Ok(delta)
    }
}

/// Add an f32 delta to a base weight, keeping the base dtype and device
fn merge_into(base: &Tensor, delta: &Tensor) -> Result<Tensor> {
    let delta = device::place(delta.clone(), base.device())?;
    let merged = base.to_dtype(DType::F32)?.add(&delta)?;
    Ok(merged.to_dtype(base.dtype())?)
}
