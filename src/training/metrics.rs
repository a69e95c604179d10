//! Epoch-level metric accumulators
use candle_core::{DType, Result, Tensor, D};

/// A metric accumulated over the batches of one epoch
pub trait EpochMetric: Default + Send {
    /// Suffix of the logged name, e.g. "acc" for `val_acc`
    const NAME: &'static str;

    fn update(&mut self, outputs: &Tensor, targets: &Tensor) -> Result<()>;

    fn compute(&self) -> Option<f64>;

    fn reset(&mut self);
}

/// Running mean of per-batch scalar losses, weighted by batch size
#[derive(Debug, Clone, Default)]
pub struct MeanLoss {
    sum: f64,
    count: usize,
}

impl MeanLoss {
    pub fn update(&mut self, loss: f64, batch_size: usize) {
        self.sum += loss * batch_size as f64;
        self.count += batch_size;
    }

    pub fn compute(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Top-1 accuracy
#[derive(Debug, Clone, Default)]
pub struct Accuracy {
    correct: usize,
    total: usize,
}

impl EpochMetric for Accuracy {
    const NAME: &'static str = "acc";

    fn update(&mut self, logits: &Tensor, labels: &Tensor) -> Result<()> {
        let predictions = logits.argmax(D::Minus1)?;
        let hits = predictions
            .eq(&labels.to_dtype(predictions.dtype())?)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_scalar::<u32>()?;
        self.correct += hits as usize;
        self.total += labels.dim(0)?;
        Ok(())
    }

    fn compute(&self) -> Option<f64> {
        (self.total > 0).then(|| self.correct as f64 / self.total as f64)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Root mean squared error
#[derive(Debug, Clone, Default)]
pub struct Rmse {
    sum_sq: f64,
    count: usize,
}

impl EpochMetric for Rmse {
    const NAME: &'static str = "rmse";

    fn update(&mut self, predictions: &Tensor, targets: &Tensor) -> Result<()> {
        let predictions = predictions.flatten_all()?.to_dtype(DType::F32)?;
        let targets = targets.flatten_all()?.to_dtype(DType::F32)?;
        let sum_sq = (&predictions - &targets)?.sqr()?.sum_all()?.to_scalar::<f32>()?;
        self.sum_sq += sum_sq as f64;
        self.count += targets.dim(0)?;
        Ok(())
    }

    fn compute(&self) -> Option<f64> {
        (self.count > 0).then(|| (self.sum_sq / self.count as f64).sqrt())
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}
