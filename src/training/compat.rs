//! Pretrained-weight compatibility checks
//!
//! A checkpoint is judged from its header before any weights are read:
//! a different architecture, or a differently shaped body tensor, is fatal.
//! A different stem (input channels), head (output count), task or key set
//! is advisory: the affected tensors keep their fresh initialisation.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use super::checkpoint::{read_header, CheckpointHeader};
use crate::config::ModelKind;
use crate::models::{signature, HEAD_PREFIX, STEM_WEIGHT};
use crate::GeoTrainError;

/// Prefix self-supervised checkpoints put in front of backbone tensors
pub const ENCODER_PREFIX: &str = "encoder.";

/// Non-fatal findings about a checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompatibilityWarning {
    TaskMismatch { checkpoint: String, model: String },
    InChannelsMismatch { checkpoint: usize, model: usize },
    NumOutputsMismatch { checkpoint: usize, model: usize },
    MissingKeys(Vec<String>),
    UnexpectedKeys(Vec<String>),
}

impl fmt::Display for CompatibilityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompatibilityWarning::TaskMismatch { checkpoint, model } => write!(
                f,
                "checkpoint was trained for '{}', loading its weights into a '{}' task",
                checkpoint, model
            ),
            CompatibilityWarning::InChannelsMismatch { checkpoint, model } => write!(
                f,
                "input channels in model: {}, input channels in pretrained model: {}; stem re-initialised",
                model, checkpoint
            ),
            CompatibilityWarning::NumOutputsMismatch { checkpoint, model } => write!(
                f,
                "num outputs in model: {}, num outputs in pretrained model: {}; head re-initialised",
                model, checkpoint
            ),
            CompatibilityWarning::MissingKeys(keys) => {
                write!(f, "keys missing from checkpoint: {}", keys.join(", "))
            }
            CompatibilityWarning::UnexpectedKeys(keys) => {
                write!(f, "unexpected keys in checkpoint: {}", keys.join(", "))
            }
        }
    }
}

/// The model a checkpoint is about to be loaded into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSpec {
    pub model: ModelKind,
    pub task: &'static str,
    pub in_channels: usize,
    pub num_outputs: usize,
}

/// Outcome of a successful check
#[derive(Debug, Clone, PartialEq)]
pub struct CompatibilityReport {
    pub architecture: ModelKind,
    pub checkpoint_task: String,
    pub warnings: Vec<CompatibilityWarning>,
    /// `(model parameter, checkpoint tensor)` pairs safe to copy
    pub loadable: Vec<(String, String)>,
}

impl CompatibilityReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Compare a checkpoint header against the target model.
pub fn check_compatibility(header: &CheckpointHeader, target: &TargetSpec) -> crate::Result<CompatibilityReport> {
    let found = &header.metadata.architecture;
    if found != target.model.name() {
        return Err(GeoTrainError::WeightMismatch {
            found: found.clone(),
            expected: target.model.name().to_string(),
            detail: String::new(),
        });
    }

    let available: BTreeMap<&str, (&str, &[usize])> = header
        .shapes
        .iter()
        .map(|(name, shape)| {
            let key = name.strip_prefix(ENCODER_PREFIX).unwrap_or(name.as_str());
            (key, (name.as_str(), shape.as_slice()))
        })
        .collect();

    let expected = signature(target.model, target.in_channels, target.num_outputs);

    let mut warnings = Vec::new();
    if header.metadata.task != target.task {
        warnings.push(CompatibilityWarning::TaskMismatch {
            checkpoint: header.metadata.task.clone(),
            model: target.task.to_string(),
        });
    }

    let mut loadable = Vec::new();
    let mut missing = Vec::new();
    let mut head_mismatch = None;
    for (name, shape) in &expected {
        let Some(&(source, found_shape)) = available.get(name.as_str()) else {
            missing.push(name.clone());
            continue;
        };

        if found_shape == shape.as_slice() {
            loadable.push((name.clone(), source.to_string()));
        } else if name == STEM_WEIGHT {
            warnings.push(CompatibilityWarning::InChannelsMismatch {
                checkpoint: found_shape.get(1).copied().unwrap_or(0),
                model: target.in_channels,
            });
        } else if name.starts_with(HEAD_PREFIX) {
            head_mismatch.get_or_insert(CompatibilityWarning::NumOutputsMismatch {
                checkpoint: found_shape.first().copied().unwrap_or(0),
                model: target.num_outputs,
            });
        } else {
            return Err(GeoTrainError::WeightMismatch {
                found: found.clone(),
                expected: target.model.name().to_string(),
                detail: format!(": tensor '{}' has shape {:?}, expected {:?}", name, found_shape, shape),
            });
        }
    }
    warnings.extend(head_mismatch);

    if !missing.is_empty() {
        warnings.push(CompatibilityWarning::MissingKeys(missing));
    }

    let expected_names: BTreeSet<&str> = expected.keys().map(String::as_str).collect();
    let unexpected: Vec<String> = available
        .keys()
        .filter(|k| !expected_names.contains(*k))
        .map(|k| k.to_string())
        .collect();
    if !unexpected.is_empty() {
        warnings.push(CompatibilityWarning::UnexpectedKeys(unexpected));
    }

    Ok(CompatibilityReport {
        architecture: target.model,
        checkpoint_task: header.metadata.task.clone(),
        warnings,
        loadable,
    })
}

/// Read a checkpoint header and check it, logging any warnings.
pub fn check_checkpoint<P: AsRef<Path>>(path: P, target: &TargetSpec) -> crate::Result<CompatibilityReport> {
    let header = read_header(path.as_ref())?;
    let report = check_compatibility(&header, target)?;

    for warning in &report.warnings {
        log::warn!("{:?}: {}", path.as_ref(), warning);
    }

    Ok(report)
}
