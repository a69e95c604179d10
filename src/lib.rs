//! geotrain - data modules and training tasks for geospatial deep learning
//!
//! Wires on-disk remote-sensing datasets into train/validation/test batch
//! loaders and wraps classification and regression tasks around candle
//! backbones.
//!
//! # Pipeline
//!
//! - **Config**: typed task configuration, validated before any allocation
//! - **DataModule**: prepares, splits and serves partitions as batch loaders
//! - **Task**: per-batch steps, epoch metrics and optimizer configuration
//! - **Checkpoint**: safetensors weights plus architecture metadata, checked
//!   for compatibility before binding
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use geotrain::{ClassificationConfig, ClassificationTask, DataModule, LogSink, Task};
//!
//! let mut dm = DataModule::resisc45("data/resisc45", 32, 4, 0.2, 0.2, false)?;
//! dm.setup()?;
//! let mut task = ClassificationTask::new(ClassificationConfig::default(), Arc::new(LogSink))?;
//! task.attach(&dm)?;
//! for batch in dm.train_dataloader()?.iter() {
//!     let loss = task.training_step(&batch?, 0)?;
//! }
//! ```

pub mod config;
pub mod data;
pub mod lifecycle;
pub mod models;
pub mod training;

pub use config::{ClassificationConfig, LossKind, ModelKind, RegressionConfig, WeightsSpec};
pub use data::{Batch, DataModule, DataModuleConfig, DataLoader, GeoDataset, Partition, SplitSpec};
pub use lifecycle::Stage;
pub use training::{
    ClassificationTask, CompatibilityWarning, EventSink, LogEvent, LogSink, MemorySink,
    RegressionTask, Task,
};

use std::fmt;

/// Which user-facing option an [`GeoTrainError::InvalidOption`] refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Model,
    Loss,
    Weight,
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptionKind::Model => "Model",
            OptionKind::Loss => "Loss",
            OptionKind::Weight => "Weight",
        };
        f.write_str(name)
    }
}

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum GeoTrainError {
    /// Unknown model, loss or weights identifier. The message format is
    /// matched on by callers and must not change.
    #[error("{kind} type '{value}' is not valid.")]
    InvalidOption { kind: OptionKind, value: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Trying to load {found} weights into a {expected}{detail}")]
    WeightMismatch {
        found: String,
        expected: String,
        detail: String,
    },

    #[error("Cannot {action} while {stage}")]
    Lifecycle { action: &'static str, stage: Stage },

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Batch error: {0}")]
    Batch(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("NumPy read error: {0}")]
    Npy(#[from] ndarray_npy::ReadNpyError),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
}

impl GeoTrainError {
    /// True for errors raised while validating configuration, before any
    /// tensor allocation or dataset read.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            GeoTrainError::InvalidOption { .. } | GeoTrainError::Config(_)
        )
    }

    pub(crate) fn invalid(kind: OptionKind, value: impl Into<String>) -> Self {
        GeoTrainError::InvalidOption {
            kind,
            value: value.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GeoTrainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_option_message() {
        let err = GeoTrainError::invalid(OptionKind::Weight, "invalid_weights");
        assert_eq!(err.to_string(), "Weight type 'invalid_weights' is not valid.");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_weight_mismatch_message() {
        let err = GeoTrainError::WeightMismatch {
            found: "resnet18".to_string(),
            expected: "resnet50".to_string(),
            detail: String::new(),
        };
        assert_eq!(err.to_string(), "Trying to load resnet18 weights into a resnet50");
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_lifecycle_message() {
        let err = GeoTrainError::Lifecycle {
            action: "build a loader",
            stage: Stage::Uninitialized,
        };
        assert_eq!(err.to_string(), "Cannot build a loader while uninitialized");
    }
}
