//! Model checkpointing with safetensors
//!
//! Architecture and training metadata live in the safetensors `__metadata__`
//! map, so compatibility can be judged from the header alone.
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use serde::Deserialize;

use crate::GeoTrainError;

const METADATA_KEY: &str = "__metadata__";

/// Headers larger than this are treated as corrupt
const MAX_HEADER_LEN: u64 = 100_000_000;

/// Checkpoint metadata
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    /// Backbone architecture, e.g. "resnet18"
    pub architecture: String,
    /// Task the weights were trained for: "classification", "regression",
    /// or a self-supervised method such as "byol"
    pub task: String,
    pub in_channels: usize,
    pub num_outputs: usize,
    /// Training step
    pub step: usize,
    /// Learning rate at checkpoint
    pub learning_rate: f64,
    /// Loss at checkpoint
    pub loss: Option<f64>,
}

impl CheckpointMetadata {
    fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::from([
            ("architecture".to_string(), self.architecture.clone()),
            ("task".to_string(), self.task.clone()),
            ("in_channels".to_string(), self.in_channels.to_string()),
            ("num_outputs".to_string(), self.num_outputs.to_string()),
            ("step".to_string(), self.step.to_string()),
            ("learning_rate".to_string(), self.learning_rate.to_string()),
        ]);
        if let Some(loss) = self.loss {
            map.insert("loss".to_string(), loss.to_string());
        }
        map
    }

    fn from_map(map: &HashMap<String, String>) -> crate::Result<Self> {
        let architecture = map
            .get("architecture")
            .cloned()
            .ok_or_else(|| GeoTrainError::Checkpoint("metadata has no architecture".to_string()))?;

        fn parsed<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str) -> crate::Result<Option<T>> {
            match map.get(key) {
                None => Ok(None),
                Some(raw) => raw.parse().map(Some).map_err(|_| {
                    GeoTrainError::Checkpoint(format!("metadata field {} has invalid value '{}'", key, raw))
                }),
            }
        }

        Ok(Self {
            architecture,
            task: map.get("task").cloned().unwrap_or_else(|| "classification".to_string()),
            in_channels: parsed(map, "in_channels")?.unwrap_or(0),
            num_outputs: parsed(map, "num_outputs")?.unwrap_or(0),
            step: parsed(map, "step")?.unwrap_or(0),
            learning_rate: parsed(map, "learning_rate")?.unwrap_or(0.0),
            loss: parsed(map, "loss")?,
        })
    }
}

/// What the header of a checkpoint says, without its tensor data
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointHeader {
    pub metadata: CheckpointMetadata,
    pub shapes: BTreeMap<String, Vec<usize>>,
}

#[derive(Deserialize)]
struct HeaderEntry {
    shape: Vec<usize>,
}

/// Read only the length prefix and JSON header of a safetensors file
pub fn read_header<P: AsRef<Path>>(path: P) -> crate::Result<CheckpointHeader> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);

    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes)?;
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len > MAX_HEADER_LEN {
        return Err(GeoTrainError::Checkpoint(format!(
            "{:?}: header length {} is not plausible",
            path, header_len
        )));
    }

    let mut header = vec![0u8; header_len as usize];
    reader.read_exact(&mut header)?;
    let raw: HashMap<String, serde_json::Value> = serde_json::from_slice(&header)?;

    let mut metadata = None;
    let mut shapes = BTreeMap::new();
    for (name, value) in raw {
        if name == METADATA_KEY {
            let map: HashMap<String, String> = serde_json::from_value(value)?;
            metadata = Some(CheckpointMetadata::from_map(&map)?);
        } else {
            let entry: HeaderEntry = serde_json::from_value(value)?;
            shapes.insert(name, entry.shape);
        }
    }

    let metadata = metadata.ok_or_else(|| {
        GeoTrainError::Checkpoint(format!("{:?} carries no metadata", path))
    })?;

    Ok(CheckpointHeader { metadata, shapes })
}

/// Model checkpoint
pub struct Checkpoint {
    /// Model parameters
    pub tensors: HashMap<String, Tensor>,
    /// Metadata
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Create new checkpoint
    pub fn new(tensors: HashMap<String, Tensor>, metadata: CheckpointMetadata) -> Self {
        Self { tensors, metadata }
    }

    /// Save checkpoint to file. Tensors are stored as little-endian f32.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let mut buffers = Vec::with_capacity(self.tensors.len());
        for (name, tensor) in &self.tensors {
            let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            buffers.push((name.clone(), tensor.dims().to_vec(), bytes));
        }

        let views = buffers
            .iter()
            .map(|(name, shape, bytes)| Ok((name.clone(), TensorView::new(Dtype::F32, shape.clone(), bytes)?)))
            .collect::<crate::Result<Vec<_>>>()?;

        safetensors::serialize_to_file(views, &Some(self.metadata.to_map()), path.as_ref())?;

        log::debug!(
            "Saved {} tensors to {:?} (step {})",
            self.tensors.len(),
            path.as_ref(),
            self.metadata.step
        );
        Ok(())
    }

    /// Load checkpoint from file
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> crate::Result<Self> {
        let header = read_header(path.as_ref())?;
        let tensors = candle_core::safetensors::load(path.as_ref(), device)?;
        Ok(Self {
            tensors,
            metadata: header.metadata,
        })
    }
}
