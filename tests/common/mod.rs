//! On-disk fixtures shared by the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use geotrain::models::signature;
use geotrain::training::{Checkpoint, CheckpointMetadata};
use geotrain::ModelKind;
use ndarray::{Array1, Array4};
use ndarray_npy::WriteNpyExt;

pub const SIZE: usize = 8;

fn images(n: usize, channels: usize) -> Array4<f32> {
    // Each sample is filled with its own index so batches can be traced
    Array4::from_shape_fn((n, channels, SIZE, SIZE), |(i, c, _, _)| i as f32 + c as f32 * 0.01)
}

/// `dataset.json`, `images.npy` and i64 `labels.npy` for `n` samples
pub fn write_classification(dir: &Path, n: usize, channels: usize, classes: usize) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    let class_names: Vec<String> = (0..classes).map(|c| format!("class_{}", c)).collect();
    let metadata = serde_json::json!({
        "name": dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        "target": "class",
        "classes": class_names,
    });
    std::fs::write(dir.join("dataset.json"), serde_json::to_vec_pretty(&metadata)?)?;

    images(n, channels).write_npy(File::create(dir.join("images.npy"))?)?;
    let labels = Array1::from_shape_fn(n, |i| (i % classes) as i64);
    labels.write_npy(File::create(dir.join("labels.npy"))?)?;
    Ok(())
}

/// Scalar-target dataset with one group id per sample
pub fn write_regression(dir: &Path, n: usize, channels: usize, groups: &[i64]) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    let metadata = serde_json::json!({ "name": "cyclone", "target": "value" });
    std::fs::write(dir.join("dataset.json"), serde_json::to_vec(&metadata)?)?;

    images(n, channels).write_npy(File::create(dir.join("images.npy"))?)?;
    let labels = Array1::from_shape_fn(n, |i| 20.0 + i as f32);
    labels.write_npy(File::create(dir.join("labels.npy"))?)?;
    Array1::from_vec(groups.to_vec()).write_npy(File::create(dir.join("groups.npy"))?)?;
    Ok(())
}

/// Checkpoint with the parameter layout of `model`
pub fn write_checkpoint(
    path: &Path,
    model: ModelKind,
    task: &str,
    in_channels: usize,
    num_outputs: usize,
) -> anyhow::Result<()> {
    let device = Device::Cpu;
    let mut tensors = HashMap::new();
    for (name, shape) in signature(model, in_channels, num_outputs) {
        tensors.insert(name, Tensor::full(0.5f32, shape, &device)?.to_dtype(DType::F32)?);
    }
    let metadata = CheckpointMetadata {
        architecture: model.name().to_string(),
        task: task.to_string(),
        in_channels,
        num_outputs,
        step: 100,
        learning_rate: 1e-3,
        loss: None,
    };
    Checkpoint::new(tensors, metadata).save(path)?;
    Ok(())
}

/// Replace every label in `dir` with `label` and drop `dataset.json`
pub fn relabel_without_metadata(dir: &Path, label: i64) -> anyhow::Result<()> {
    let n = ndarray_npy::read_npy::<_, Array1<i64>>(dir.join("labels.npy"))?.len();
    Array1::from_elem(n, label).write_npy(File::create(dir.join("labels.npy"))?)?;
    std::fs::remove_file(dir.join("dataset.json"))?;
    Ok(())
}
