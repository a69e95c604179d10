//! Weight loading from safetensors files
use std::path::Path;

use candle_core::Device;
use candle_nn::VarMap;

use crate::training::compat::CompatibilityReport;
use crate::GeoTrainError;

/// Copy the tensors a compatibility report marked loadable into `varmap`.
///
/// Must only be called with a report produced for this checkpoint; tensors the
/// report skipped keep their fresh initialisation.
///
/// # Returns
/// Number of parameters overwritten
pub fn bind_weights<P: AsRef<Path>>(
    varmap: &VarMap,
    weights_path: P,
    report: &CompatibilityReport,
    device: &Device,
) -> crate::Result<usize> {
    let tensors = candle_core::safetensors::load(weights_path.as_ref(), device)?;

    let data = varmap
        .data()
        .lock()
        .map_err(|_| GeoTrainError::Checkpoint("parameter store lock poisoned".to_string()))?;

    let mut bound = 0;
    for (target, source) in &report.loadable {
        let tensor = tensors.get(source).ok_or_else(|| {
            GeoTrainError::Checkpoint(format!(
                "tensor '{}' listed in header but missing from {:?}",
                source,
                weights_path.as_ref()
            ))
        })?;
        let var = data.get(target).ok_or_else(|| {
            GeoTrainError::Checkpoint(format!("model has no parameter '{}'", target))
        })?;
        var.set(&tensor.to_dtype(var.dtype())?)?;
        bound += 1;
    }

    log::info!(
        "Loaded {}/{} parameters from {:?}",
        bound,
        data.len(),
        weights_path.as_ref()
    );

    Ok(bound)
}
