//! Scalar regression task (e.g. cyclone wind speed)
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use super::compat::{CompatibilityWarning, TargetSpec};
use super::events::EventSink;
use super::losses::mse;
use super::metrics::Rmse;
use super::task::{EpochSummary, OptimizerConfig, Task, TaskCore};
use crate::config::{ModelKind, RegressionConfig};
use crate::data::{Batch, DataModule, TargetKind};
use crate::lifecycle::Stage;
use crate::GeoTrainError;

/// Task name recorded in checkpoint metadata
pub const TASK_NAME: &str = "regression";

/// Regression with MSE loss and RMSE as the epoch metric.
pub struct RegressionTask {
    config: RegressionConfig,
    model: ModelKind,
    core: TaskCore<Rmse>,
}

impl RegressionTask {
    pub fn new(config: RegressionConfig, sink: Arc<dyn EventSink>) -> crate::Result<Self> {
        Self::with_device(config, sink, Device::Cpu)
    }

    pub fn with_device(config: RegressionConfig, sink: Arc<dyn EventSink>, device: Device) -> crate::Result<Self> {
        let validated = config.validate()?;
        let target = TargetSpec {
            model: validated.model,
            task: TASK_NAME,
            in_channels: config.in_channels,
            num_outputs: config.num_outputs,
        };

        let core = TaskCore::new(
            target,
            DType::F32,
            &validated.weights,
            config.pretrained_dir.as_deref(),
            config.learning_rate,
            config.learning_rate_schedule_patience,
            sink,
            device,
        )?;

        log::info!(
            "Regression task: {}, {} input channels, {} outputs",
            validated.model,
            config.in_channels,
            config.num_outputs
        );

        Ok(Self {
            config,
            model: validated.model,
            core,
        })
    }

    pub fn config(&self) -> &RegressionConfig {
        &self.config
    }

    pub fn model_kind(&self) -> ModelKind {
        self.model
    }

    pub fn compatibility_warnings(&self) -> &[CompatibilityWarning] {
        self.core.warnings()
    }

    pub fn steps(&self) -> usize {
        self.core.steps()
    }

    pub fn device(&self) -> &Device {
        self.core.device()
    }

    pub fn forward(&self, images: &Tensor) -> crate::Result<Tensor> {
        self.core.forward(images)
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        self.core.save_checkpoint(path)
    }
}

impl Task for RegressionTask {
    fn stage(&self) -> Stage {
        self.core.stage()
    }

    fn attach(&mut self, datamodule: &DataModule) -> crate::Result<()> {
        let num_outputs = self.config.num_outputs;
        self.core.attach(datamodule, |dm| {
            if dm.target_kind()? != TargetKind::Value {
                return Err(GeoTrainError::Config(
                    "regression needs a dataset with scalar targets".to_string(),
                ));
            }
            // Datasets carry one value per sample
            if num_outputs != 1 {
                return Err(GeoTrainError::Config(format!(
                    "scalar targets need num_outputs = 1, got {}",
                    num_outputs
                )));
            }
            Ok(())
        })
    }

    fn training_step(&mut self, batch: &Batch, batch_idx: usize) -> crate::Result<Tensor> {
        self.core.step(Stage::Training, "run a training step", batch, batch_idx, mse)
    }

    fn training_epoch_end(&mut self) -> crate::Result<EpochSummary> {
        self.core.epoch_end(Stage::Training, "end a training epoch")
    }

    fn validation_step(&mut self, batch: &Batch, batch_idx: usize) -> crate::Result<Tensor> {
        self.core.step(Stage::Validating, "run a validation step", batch, batch_idx, mse)
    }

    fn validation_epoch_end(&mut self) -> crate::Result<EpochSummary> {
        self.core.epoch_end(Stage::Validating, "end a validation epoch")
    }

    fn test_step(&mut self, batch: &Batch, batch_idx: usize) -> crate::Result<Tensor> {
        self.core.step(Stage::Testing, "run a test step", batch, batch_idx, mse)
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
