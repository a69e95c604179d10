//! Task configuration
//!
//! Typed replacements for the YAML task defaults. Identifiers arrive as
//! strings (from JSON or code) and are resolved into enums by `validate()`,
//! which runs before any tensor is allocated.
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{GeoTrainError, OptionKind};

/// Backbone architectures known to the task factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    ResNet18,
    ResNet34,
    ResNet50,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [ModelKind::ResNet18, ModelKind::ResNet34, ModelKind::ResNet50];

    pub fn name(self) -> &'static str {
        match self {
            ModelKind::ResNet18 => "resnet18",
            ModelKind::ResNet34 => "resnet34",
            ModelKind::ResNet50 => "resnet50",
        }
    }

    /// Width of the pooled feature vector fed to the head
    pub fn feature_dim(self) -> usize {
        match self {
            ModelKind::ResNet18 | ModelKind::ResNet34 => 512,
            ModelKind::ResNet50 => 2048,
        }
    }

    pub fn parse(value: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.name() == value)
            .ok_or_else(|| GeoTrainError::invalid(OptionKind::Model, value))
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classification loss functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    CrossEntropy,
    Jaccard,
    Focal,
}

impl LossKind {
    pub fn name(self) -> &'static str {
        match self {
            LossKind::CrossEntropy => "ce",
            LossKind::Jaccard => "jaccard",
            LossKind::Focal => "focal",
        }
    }

    pub fn parse(value: &str) -> crate::Result<Self> {
        match value {
            "ce" => Ok(LossKind::CrossEntropy),
            "jaccard" => Ok(LossKind::Jaccard),
            "focal" => Ok(LossKind::Focal),
            other => Err(GeoTrainError::invalid(OptionKind::Loss, other)),
        }
    }
}

/// Where initial weights come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightsSpec {
    ImageNet,
    Random,
    Checkpoint(PathBuf),
}

impl WeightsSpec {
    /// Resolve a weights identifier. Anything other than `imagenet` or
    /// `random` must name an existing checkpoint file.
    pub fn parse(value: &str) -> crate::Result<Self> {
        match value {
            "imagenet" => Ok(WeightsSpec::ImageNet),
            "random" => Ok(WeightsSpec::Random),
            path if Path::new(path).is_file() => Ok(WeightsSpec::Checkpoint(PathBuf::from(path))),
            other => Err(GeoTrainError::invalid(OptionKind::Weight, other)),
        }
    }
}

fn check_learning_rate(lr: f64) -> crate::Result<()> {
    if !lr.is_finite() || lr <= 0.0 {
        return Err(GeoTrainError::Config(format!(
            "learning_rate must be a positive number, got {}",
            lr
        )));
    }
    Ok(())
}

fn check_positive(name: &str, value: usize) -> crate::Result<()> {
    if value == 0 {
        return Err(GeoTrainError::Config(format!("{} must be > 0", name)));
    }
    Ok(())
}

/// Configuration for a classification task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    /// Backbone identifier, e.g. "resnet18"
    #[serde(alias = "model")]
    pub classification_model: String,

    /// Loss identifier: "ce", "jaccard" or "focal"
    pub loss: String,

    /// "imagenet", "random" or a path to a checkpoint
    pub weights: String,

    pub learning_rate: f64,

    /// Epochs without val_loss improvement before the LR is reduced
    pub learning_rate_schedule_patience: usize,

    pub in_channels: usize,

    pub num_classes: usize,

    /// Directory searched for `<model>_imagenet.safetensors`
    #[serde(default)]
    pub pretrained_dir: Option<PathBuf>,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            classification_model: "resnet18".to_string(),
            loss: "ce".to_string(),
            weights: "random".to_string(),
            learning_rate: 1e-3,
            learning_rate_schedule_patience: 2,
            in_channels: 3,
            num_classes: 17,
            pretrained_dir: None,
        }
    }
}

/// A classification config whose identifiers have been resolved
#[derive(Debug, Clone)]
pub struct ValidatedClassification {
    pub model: ModelKind,
    pub loss: LossKind,
    pub weights: WeightsSpec,
}

impl ClassificationConfig {
    /// Load from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Validate configuration. Checks model, loss and weights in that order.
    pub fn validate(&self) -> crate::Result<ValidatedClassification> {
        let model = ModelKind::parse(&self.classification_model)?;
        let loss = LossKind::parse(&self.loss)?;
        let weights = WeightsSpec::parse(&self.weights)?;

        check_learning_rate(self.learning_rate)?;
        check_positive("in_channels", self.in_channels)?;
        check_positive("num_classes", self.num_classes)?;

        Ok(ValidatedClassification {
            model,
            loss,
            weights,
        })
    }
}

/// Configuration for a regression task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionConfig {
    pub model: String,

    #[serde(default = "default_random")]
    pub weights: String,

    pub learning_rate: f64,

    pub learning_rate_schedule_patience: usize,

    #[serde(default = "default_in_channels")]
    pub in_channels: usize,

    #[serde(default = "default_num_outputs")]
    pub num_outputs: usize,

    #[serde(default)]
    pub pretrained_dir: Option<PathBuf>,
}

fn default_random() -> String {
    "random".to_string()
}

fn default_in_channels() -> usize {
    3
}

fn default_num_outputs() -> usize {
    1
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            model: "resnet18".to_string(),
            weights: default_random(),
            learning_rate: 1e-3,
            learning_rate_schedule_patience: 2,
            in_channels: default_in_channels(),
            num_outputs: default_num_outputs(),
            pretrained_dir: None,
        }
    }
}

/// A regression config whose identifiers have been resolved
#[derive(Debug, Clone)]
pub struct ValidatedRegression {
    pub model: ModelKind,
    pub weights: WeightsSpec,
}

impl RegressionConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn validate(&self) -> crate::Result<ValidatedRegression> {
        let model = ModelKind::parse(&self.model)?;
        let weights = WeightsSpec::parse(&self.weights)?;

        check_learning_rate(self.learning_rate)?;
        check_positive("in_channels", self.in_channels)?;
        check_positive("num_outputs", self.num_outputs)?;

        Ok(ValidatedRegression { model, weights })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let validated = ClassificationConfig::default().validate().unwrap();
        assert_eq!(validated.model, ModelKind::ResNet18);
        assert_eq!(validated.loss, LossKind::CrossEntropy);
        assert_eq!(validated.weights, WeightsSpec::Random);

        let validated = RegressionConfig::default().validate().unwrap();
        assert_eq!(validated.model, ModelKind::ResNet18);
    }

    #[test]
    fn test_invalid_model() {
        let config = ClassificationConfig {
            classification_model: "invalid_model".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "Model type 'invalid_model' is not valid.");
    }

    #[test]
    fn test_invalid_loss() {
        let config = ClassificationConfig {
            loss: "invalid_loss".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "Loss type 'invalid_loss' is not valid.");
    }

    #[test]
    fn test_invalid_weights() {
        let config = ClassificationConfig {
            weights: "invalid_weights".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "Weight type 'invalid_weights' is not valid.");
    }

    #[test]
    fn test_model_checked_before_loss() {
        let config = ClassificationConfig {
            classification_model: "vgg".to_string(),
            loss: "hinge".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().starts_with("Model type 'vgg'"));
    }

    #[test]
    fn test_invalid_regression_model() {
        let config = RegressionConfig {
            model: "invalid_model".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "Model type 'invalid_model' is not valid.");
    }

    #[test]
    fn test_numeric_checks() {
        let config = ClassificationConfig {
            learning_rate: 0.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(GeoTrainError::Config(_))));

        let config = ClassificationConfig {
            num_classes: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(GeoTrainError::Config(_))));
    }

    #[test]
    fn test_config_deserialization() {
        let json = r#"{
            "model": "resnet50",
            "loss": "focal",
            "weights": "imagenet",
            "learning_rate": 0.0001,
            "learning_rate_schedule_patience": 6,
            "in_channels": 10,
            "num_classes": 45
        }"#;

        let config: ClassificationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.classification_model, "resnet50");
        assert_eq!(config.in_channels, 10);
        assert!(config.pretrained_dir.is_none());

        let validated = config.validate().unwrap();
        assert_eq!(validated.loss, LossKind::Focal);
        assert_eq!(validated.weights, WeightsSpec::ImageNet);
    }

    #[test]
    fn test_regression_defaults_from_json() {
        let json = r#"{ "model": "resnet18", "learning_rate": 0.001, "learning_rate_schedule_patience": 2 }"#;
        let config: RegressionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.weights, "random");
        assert_eq!(config.in_channels, 3);
        assert_eq!(config.num_outputs, 1);
    }
}
