//! Scene classification task
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use super::compat::{CompatibilityWarning, TargetSpec};
use super::events::EventSink;
use super::losses::classification_loss;
use super::metrics::Accuracy;
use super::task::{EpochSummary, OptimizerConfig, Task, TaskCore};
use crate::config::{ClassificationConfig, LossKind, ModelKind};
use crate::data::{Batch, DataModule, TargetKind};
use crate::lifecycle::Stage;
use crate::GeoTrainError;

/// Task name recorded in checkpoint metadata
pub const TASK_NAME: &str = "classification";

/// Image classification with cross entropy, Jaccard or focal loss and
/// accuracy as the epoch metric.
pub struct ClassificationTask {
    config: ClassificationConfig,
    model: ModelKind,
    loss: LossKind,
    core: TaskCore<Accuracy>,
}

impl ClassificationTask {
    /// Validate `config`, check any pretrained weights and build the model on CPU.
    pub fn new(config: ClassificationConfig, sink: Arc<dyn EventSink>) -> crate::Result<Self> {
        Self::with_device(config, sink, Device::Cpu)
    }

    pub fn with_device(config: ClassificationConfig, sink: Arc<dyn EventSink>, device: Device) -> crate::Result<Self> {
        let validated = config.validate()?;
        let target = TargetSpec {
            model: validated.model,
            task: TASK_NAME,
            in_channels: config.in_channels,
            num_outputs: config.num_classes,
        };

        let core = TaskCore::new(
            target,
            DType::U32,
            &validated.weights,
            config.pretrained_dir.as_deref(),
            config.learning_rate,
            config.learning_rate_schedule_patience,
            sink,
            device,
        )?;

        log::info!(
            "Classification task: {}, {} loss, {} input channels, {} classes",
            validated.model,
            validated.loss.name(),
            config.in_channels,
            config.num_classes
        );

        Ok(Self {
            config,
            model: validated.model,
            loss: validated.loss,
            core,
        })
    }

    pub fn config(&self) -> &ClassificationConfig {
        &self.config
    }

    pub fn model_kind(&self) -> ModelKind {
        self.model
    }

    pub fn loss_kind(&self) -> LossKind {
        self.loss
    }

    /// Advisory findings from loading pretrained weights
    pub fn compatibility_warnings(&self) -> &[CompatibilityWarning] {
        self.core.warnings()
    }

    /// Optimizer steps taken so far
    pub fn steps(&self) -> usize {
        self.core.steps()
    }

    pub fn device(&self) -> &Device {
        self.core.device()
    }

    /// Logits `[B, num_classes]` for images `[B, C, H, W]`
    pub fn forward(&self, images: &Tensor) -> crate::Result<Tensor> {
        self.core.forward(images)
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        self.core.save_checkpoint(path)
    }

    fn step(&mut self, stage: Stage, action: &'static str, batch: &Batch, batch_idx: usize) -> crate::Result<Tensor> {
        let loss = self.loss;
        self.core.step(stage, action, batch, batch_idx, |logits, labels| {
            classification_loss(loss, logits, labels)
        })
    }
}

impl Task for ClassificationTask {
    fn stage(&self) -> Stage {
        self.core.stage()
    }

    fn attach(&mut self, datamodule: &DataModule) -> crate::Result<()> {
        let num_classes = self.config.num_classes;
        self.core.attach(datamodule, |dm| {
            if dm.target_kind()? != TargetKind::Class {
                return Err(GeoTrainError::Config(
                    "classification needs a dataset with class labels".to_string(),
                ));
            }
            let dataset_classes = dm.num_classes()?;
            if dataset_classes > num_classes {
                return Err(GeoTrainError::Config(format!(
                    "dataset has {} classes, model has num_classes = {}",
                    dataset_classes, num_classes
                )));
            }
            // Class names are optional, the labels themselves are not
            if let Some(max) = dm.max_class()? {
                if max as usize >= num_classes {
                    return Err(GeoTrainError::Config(format!(
                        "dataset has class label {}, model has num_classes = {}",
                        max, num_classes
                    )));
                }
            }
            Ok(())
        })
    }

    fn training_step(&mut self, batch: &Batch, batch_idx: usize) -> crate::Result<Tensor> {
        self.step(Stage::Training, "run a training step", batch, batch_idx)
    }

    fn training_epoch_end(&mut self) -> crate::Result<EpochSummary> {
        self.core.epoch_end(Stage::Training, "end a training epoch")
    }

    fn validation_step(&mut self, batch: &Batch, batch_idx: usize) -> crate::Result<Tensor> {
        self.step(Stage::Validating, "run a validation step", batch, batch_idx)
    }

    fn validation_epoch_end(&mut self) -> crate::Result<EpochSummary> {
        self.core.epoch_end(Stage::Validating, "end a validation epoch")
    }

    fn test_step(&mut self, batch: &Batch, batch_idx: usize) -> crate::Result<Tensor> {
        self.step(Stage::Testing, "run a test step", batch, batch_idx)
    }

    fn test_epoch_end(&mut self) -> crate::Result<EpochSummary> {
        self.core.epoch_end(Stage::Testing, "end a test epoch")
    }

    fn configure_optimizers(&self) -> crate::Result<OptimizerConfig> {
        self.core.configure_optimizers()
    }

    fn complete(&mut self) -> crate::Result<()> {
        self.core.complete()
    }
}
