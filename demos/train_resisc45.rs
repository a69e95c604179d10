//! RESISC45 scene classification - one data module, one task, a plain epoch loop
//!
//! Usage: train_resisc45 <dataset dir> [task config json]
use std::sync::Arc;

use candle_core::Device;
use candle_nn::Optimizer;
use geotrain::{ClassificationConfig, ClassificationTask, DataModule, LogSink, Task};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("=== geotrain - RESISC45 classification ===");

    let device = if candle_core::utils::cuda_is_available() {
        Device::new_cuda(0)?
    } else {
        Device::Cpu
    };
    log::info!("Using device: {:?}", device);

    let mut args = std::env::args().skip(1);
    let data_path = args.next().unwrap_or_else(|| "data/resisc45".to_string());
    let config = match args.next() {
        Some(path) => ClassificationConfig::from_json_file(path)?,
        None => ClassificationConfig {
            num_classes: 45,
            learning_rate: 1e-3,
            learning_rate_schedule_patience: 6,
            ..Default::default()
        },
    };

    let mut datamodule = DataModule::resisc45(&data_path, 32, 4, 0.2, 0.2, false)?.with_device(device.clone());
    datamodule.setup()?;

    let mut task = ClassificationTask::with_device(config, Arc::new(LogSink), device)?;
    task.attach(&datamodule)?;
    for warning in task.compatibility_warnings() {
        log::warn!("{}", warning);
    }

    let mut optimizers = task.configure_optimizers()?;
    let num_epochs = 10;

    for epoch in 0..num_epochs {
        log::info!("=== Epoch {}/{} ===", epoch + 1, num_epochs);

        let train = datamodule.train_dataloader()?;
        for (batch_idx, batch) in train.iter().enumerate() {
            let loss = task.training_step(&batch?, batch_idx)?;
            optimizers.optimizer.backward_step(&loss)?;
        }
        let summary = task.training_epoch_end()?;
        log::info!("train: loss={:?} acc={:?}", summary.loss, summary.metric);

        let val = datamodule.val_dataloader()?;
        for (batch_idx, batch) in val.iter().enumerate() {
            task.validation_step(&batch?, batch_idx)?;
        }
        let summary = task.validation_epoch_end()?;
        if let Some(val_loss) = summary.loss {
            let lr = optimizers
                .lr_scheduler
                .step_optimizer(val_loss, &mut optimizers.optimizer);
            log::info!("{}={:.4}, lr={:.2e}", optimizers.monitor, val_loss, lr);
        }
    }

    let test = datamodule.test_dataloader()?;
    for (batch_idx, batch) in test.iter().enumerate() {
        task.test_step(&batch?, batch_idx)?;
    }
    let summary = task.test_epoch_end()?;
    log::info!("test: loss={:?} acc={:?}", summary.loss, summary.metric);

    task.complete()?;

    std::fs::create_dir_all("checkpoints")?;
    task.save_checkpoint("checkpoints/resisc45_final.safetensors")?;
    log::info!("Training complete!");

    Ok(())
}
