//! Task lifecycle and the step/epoch machinery shared by all tasks
//!
//! A task owns its backbone and parameters. The caller drives the epoch loop:
//! it feeds batches to the `*_step` methods, closes each epoch with the
//! matching `*_epoch_end`, and applies gradients with the optimizer from
//! [`Task::configure_optimizers`].
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use super::checkpoint::{Checkpoint, CheckpointMetadata};
use super::compat::{check_checkpoint, CompatibilityWarning, TargetSpec};
use super::events::{EventSink, LogEvent};
use super::metrics::{EpochMetric, MeanLoss};
use super::scheduler::{PlateauConfig, ReduceLrOnPlateau};
use crate::config::{ModelKind, WeightsSpec};
use crate::data::{Batch, DataModule};
use crate::lifecycle::Stage;
use crate::models::loader::bind_weights;
use crate::models::{Backbone, ResNetProbe};
use crate::GeoTrainError;

/// Metric the plateau scheduler watches
pub const MONITOR: &str = "val_loss";

/// What [`Task::configure_optimizers`] hands back to the training loop
pub struct OptimizerConfig {
    pub optimizer: AdamW,
    pub lr_scheduler: ReduceLrOnPlateau,
    /// Logged metric to feed into `lr_scheduler` after each validation epoch
    pub monitor: &'static str,
}

/// Aggregates of one finished epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub stage: Stage,
    pub batches: usize,
    /// Sample-weighted mean loss, `None` for an epoch without batches
    pub loss: Option<f64>,
    /// Task metric name and value, e.g. `("acc", 0.93)`
    pub metric: Option<(&'static str, f64)>,
}

/// A trainable task: per-batch steps, epoch aggregation and optimizer setup.
pub trait Task {
    fn stage(&self) -> Stage;

    /// Bind to a data module that has been set up. Moves the task to
    /// [`Stage::DataReady`].
    fn attach(&mut self, datamodule: &DataModule) -> crate::Result<()>;

    /// Forward a batch and return the scalar loss to back-propagate.
    fn training_step(&mut self, batch: &Batch, batch_idx: usize) -> crate::Result<Tensor>;

    fn training_epoch_end(&mut self) -> crate::Result<EpochSummary>;

    fn validation_step(&mut self, batch: &Batch, batch_idx: usize) -> crate::Result<Tensor>;

    fn validation_epoch_end(&mut self) -> crate::Result<EpochSummary>;

    fn test_step(&mut self, batch: &Batch, batch_idx: usize) -> crate::Result<Tensor>;

    fn test_epoch_end(&mut self) -> crate::Result<EpochSummary>;

    fn configure_optimizers(&self) -> crate::Result<OptimizerConfig>;

    /// Finish the task. Every later step fails.
    fn complete(&mut self) -> crate::Result<()>;
}

/// `<pretrained_dir>/<model>_imagenet.safetensors`, if it exists
pub fn imagenet_weights(model: ModelKind, pretrained_dir: Option<&Path>) -> Option<PathBuf> {
    pretrained_dir
        .map(|dir| dir.join(format!("{}_imagenet.safetensors", model.name())))
        .filter(|path| path.is_file())
}

/// Backbone, parameters, lifecycle and epoch accumulators of one task
pub(crate) struct TaskCore<M> {
    target: TargetSpec,
    label_dtype: DType,
    model: ResNetProbe,
    varmap: VarMap,
    device: Device,
    learning_rate: f64,
    patience: usize,
    warnings: Vec<CompatibilityWarning>,
    sink: Arc<dyn EventSink>,
    stage: Stage,
    steps: usize,
    batches: usize,
    loss: MeanLoss,
    metric: M,
    last_train_loss: Option<f64>,
}

impl<M: EpochMetric> TaskCore<M> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        target: TargetSpec,
        label_dtype: DType,
        weights: &WeightsSpec,
        pretrained_dir: Option<&Path>,
        learning_rate: f64,
        patience: usize,
        sink: Arc<dyn EventSink>,
        device: Device,
    ) -> crate::Result<Self> {
        let source = match weights {
            WeightsSpec::Random => None,
            WeightsSpec::Checkpoint(path) => Some(path.clone()),
            WeightsSpec::ImageNet => {
                let found = imagenet_weights(target.model, pretrained_dir);
                if found.is_none() {
                    log::warn!(
                        "No ImageNet weights for {} available, using random initialisation",
                        target.model
                    );
                }
                found
            }
        };

        // Judged from the header only, before anything is allocated
        let report = source
            .as_ref()
            .map(|path| check_checkpoint(path, &target))
            .transpose()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = ResNetProbe::new(target.model, target.in_channels, target.num_outputs, vb)?;

        let mut warnings = Vec::new();
        if let (Some(path), Some(report)) = (source.as_ref(), report) {
            bind_weights(&varmap, path, &report, &device)?;
            warnings = report.warnings;
        }

        Ok(Self {
            target,
            label_dtype,
            model,
            varmap,
            device,
            learning_rate,
            patience,
            warnings,
            sink,
            stage: Stage::Uninitialized,
            steps: 0,
            batches: 0,
            loss: MeanLoss::default(),
            metric: M::default(),
            last_train_loss: None,
        })
    }

    pub(crate) fn stage(&self) -> Stage {
        self.stage
    }

    pub(crate) fn steps(&self) -> usize {
        self.steps
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn warnings(&self) -> &[CompatibilityWarning] {
        &self.warnings
    }

    pub(crate) fn forward(&self, images: &Tensor) -> crate::Result<Tensor> {
        Ok(self.model.forward(images)?)
    }

    /// Attach to a set-up data module after the task-specific `check`.
    pub(crate) fn attach<F>(&mut self, datamodule: &DataModule, check: F) -> crate::Result<()>
    where
        F: FnOnce(&DataModule) -> crate::Result<()>,
    {
        if !matches!(self.stage, Stage::Uninitialized | Stage::DataReady) {
            return Err(GeoTrainError::Lifecycle {
                action: "attach a data module",
                stage: self.stage,
            });
        }
        if datamodule.stage() != Stage::DataReady {
            return Err(GeoTrainError::Lifecycle {
                action: "attach a data module",
                stage: datamodule.stage(),
            });
        }

        let channels = datamodule.num_channels()?;
        if channels != self.target.in_channels {
            return Err(GeoTrainError::Config(format!(
                "data module yields {} channels, model expects in_channels = {}",
                channels, self.target.in_channels
            )));
        }
        check(datamodule)?;

        self.stage = Stage::DataReady;
        log::info!(
            "{} {} task attached to {:?}",
            self.target.model,
            self.target.task,
            datamodule.config().root
        );
        Ok(())
    }

    /// Run one batch of `stage`: lifecycle, then labels, then the loss.
    /// A failed step leaves the stage untouched.
    pub(crate) fn step<F>(
        &mut self,
        stage: Stage,
        action: &'static str,
        batch: &Batch,
        batch_idx: usize,
        loss_fn: F,
    ) -> crate::Result<Tensor>
    where
        F: FnOnce(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
    {
        if !self.stage.can_step_into(stage) {
            return Err(GeoTrainError::Lifecycle {
                action,
                stage: self.stage,
            });
        }

        let labels = batch.label()?;
        if labels.dtype() != self.label_dtype {
            return Err(GeoTrainError::Batch(format!(
                "{} task expects {:?} labels, got {:?}",
                self.target.task,
                self.label_dtype,
                labels.dtype()
            )));
        }

        let outputs = self.model.forward(&batch.image)?;
        let loss = loss_fn(&outputs, labels)?;
        let value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;
        self.metric.update(&outputs.detach(), labels)?;

        // Only a step that produced a loss opens the epoch
        self.stage.enter(stage, action)?;
        self.loss.update(value, batch.len());
        self.batches += 1;

        if stage == Stage::Training {
            self.steps += 1;
            self.log(stage, "train_loss", value);
        }
        log::debug!("{} batch {}: loss={:.4}", stage, batch_idx, value);

        Ok(loss)
    }

    /// Close an epoch of `stage`, log its aggregates and reset them.
    pub(crate) fn epoch_end(&mut self, stage: Stage, action: &'static str) -> crate::Result<EpochSummary> {
        self.stage.leave(stage, action)?;

        let prefix = stage.metric_prefix();
        let loss = self.loss.compute();
        let metric = self.metric.compute().map(|value| (M::NAME, value));

        if let Some(loss) = loss {
            self.log(stage, format!("{}_loss", prefix), loss);
            if stage == Stage::Training {
                self.last_train_loss = Some(loss);
            }
        }
        if let Some((name, value)) = metric {
            self.log(stage, format!("{}_{}", prefix, name), value);
        }

        let summary = EpochSummary {
            stage,
            batches: self.batches,
            loss,
            metric,
        };
        log::info!(
            "{} epoch done: {} batches, loss={:?}, {}={:?}",
            stage,
            summary.batches,
            summary.loss,
            M::NAME,
            metric.map(|(_, v)| v)
        );

        self.loss.reset();
        self.metric.reset();
        self.batches = 0;
        Ok(summary)
    }

    pub(crate) fn configure_optimizers(&self) -> crate::Result<OptimizerConfig> {
        let params = ParamsAdamW {
            lr: self.learning_rate,
            ..Default::default()
        };
        let optimizer = AdamW::new(self.varmap.all_vars(), params)?;
        let lr_scheduler = ReduceLrOnPlateau::new(
            self.learning_rate,
            PlateauConfig {
                patience: self.patience,
                ..Default::default()
            },
        );

        Ok(OptimizerConfig {
            optimizer,
            lr_scheduler,
            monitor: MONITOR,
        })
    }

    pub(crate) fn complete(&mut self) -> crate::Result<()> {
        if matches!(self.stage, Stage::Training | Stage::Validating | Stage::Testing) {
            return Err(GeoTrainError::Lifecycle {
                action: "complete",
                stage: self.stage,
            });
        }
        self.stage = Stage::Complete;
        log::info!("{} task complete after {} steps", self.target.task, self.steps);
        Ok(())
    }

    /// Write parameters and architecture metadata as safetensors
    pub(crate) fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let tensors: HashMap<String, Tensor> = {
            let data = self
                .varmap
                .data()
                .lock()
                .map_err(|_| GeoTrainError::Checkpoint("parameter store lock poisoned".to_string()))?;
            data.iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                .collect()
        };

        let metadata = CheckpointMetadata {
            architecture: self.target.model.name().to_string(),
            task: self.target.task.to_string(),
            in_channels: self.target.in_channels,
            num_outputs: self.target.num_outputs,
            step: self.steps,
            learning_rate: self.learning_rate,
            loss: self.last_train_loss,
        };

        log::info!("Saving checkpoint to {:?}", path.as_ref());
        Checkpoint::new(tensors, metadata).save(path)
    }

    fn log(&self, stage: Stage, name: impl Into<String>, value: f64) {
        self.sink.record(LogEvent {
            stage,
            name: name.into(),
            value,
            step: self.steps,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imagenet_weights_lookup() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(imagenet_weights(ModelKind::ResNet18, None), None);
        assert_eq!(imagenet_weights(ModelKind::ResNet18, Some(dir.path())), None);

        let path = dir.path().join("resnet18_imagenet.safetensors");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(imagenet_weights(ModelKind::ResNet18, Some(dir.path())), Some(path));
        assert_eq!(imagenet_weights(ModelKind::ResNet50, Some(dir.path())), None);
    }
}
