//! Loss functions
//!
//! Classification losses take logits `[B, K]` and u32 class indices `[B]`
//! and return a scalar tensor.
use candle_core::{Device, Result, Tensor, D};
use candle_nn::ops;

use crate::config::LossKind;

/// Focusing parameter of the focal loss
pub const FOCAL_GAMMA: f64 = 2.0;

const JACCARD_EPS: f64 = 1e-7;

pub fn classification_loss(kind: LossKind, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    match kind {
        LossKind::CrossEntropy => candle_nn::loss::cross_entropy(logits, labels),
        LossKind::Jaccard => jaccard_loss(logits, labels),
        LossKind::Focal => focal_loss(logits, labels, FOCAL_GAMMA),
    }
}

fn one_hot(labels: &Tensor, num_classes: usize) -> Result<Tensor> {
    let labels = labels.to_vec1::<u32>()?;
    let mut data = vec![0f32; labels.len() * num_classes];
    for (i, &c) in labels.iter().enumerate() {
        let c = c as usize;
        if c >= num_classes {
            return Err(candle_core::Error::Msg(format!(
                "label {} out of range for {} classes",
                c, num_classes
            )));
        }
        data[i * num_classes + c] = 1.0;
    }
    Tensor::from_vec(data, (labels.len(), num_classes), &Device::Cpu)
}

/// Focal loss: `-(1 - p_t)^gamma * log(p_t)`, averaged over the batch
pub fn focal_loss(logits: &Tensor, labels: &Tensor, gamma: f64) -> Result<Tensor> {
    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    let logpt = log_probs.gather(&labels.unsqueeze(1)?, 1)?.squeeze(1)?;
    let weight = logpt.exp()?.affine(-1.0, 1.0)?.relu()?.powf(gamma)?;
    (weight * logpt)?.neg()?.mean_all()
}

/// Soft multiclass Jaccard loss. Classes absent from the batch contribute 0.
pub fn jaccard_loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let num_classes = logits.dim(D::Minus1)?;
    let probs = ops::softmax(logits, D::Minus1)?;
    let target = one_hot(labels, num_classes)?
        .to_device(logits.device())?
        .to_dtype(probs.dtype())?;

    let intersection = (&probs * &target)?.sum(0)?;
    let cardinality = (probs.sum(0)? + target.sum(0)?)?;
    let union = (cardinality - &intersection)?;
    let score = (intersection / (union + JACCARD_EPS)?)?;

    let present = target.sum(0)?.gt(0.0)?.to_dtype(probs.dtype())?;
    (score.affine(-1.0, 1.0)? * present)?.mean_all()
}

/// Mean squared error between `[B, 1]` (or `[B]`) predictions and `[B]` targets
pub fn mse(predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let predictions = predictions.flatten_all()?;
    let targets = targets.to_dtype(predictions.dtype())?;
    candle_nn::loss::mse(&predictions, &targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    fn confident(device: &Device) -> Result<(Tensor, Tensor)> {
        let logits = Tensor::new(&[[10f32, -10.0, -10.0], [-10.0, 10.0, -10.0]], device)?;
        let labels = Tensor::new(&[0u32, 1], device)?;
        Ok((logits, labels))
    }

    #[test]
    fn test_losses_near_zero_when_confident_and_right() -> Result<()> {
        let device = Device::Cpu;
        let (logits, labels) = confident(&device)?;
        for kind in [LossKind::CrossEntropy, LossKind::Jaccard, LossKind::Focal] {
            let loss = scalar(&classification_loss(kind, &logits, &labels)?);
            assert!(loss.abs() < 1e-3, "{:?} loss {}", kind, loss);
        }
        Ok(())
    }

    #[test]
    fn test_losses_large_when_wrong() -> Result<()> {
        let device = Device::Cpu;
        let (logits, _) = confident(&device)?;
        let wrong = Tensor::new(&[2u32, 2], &device)?;
        for kind in [LossKind::CrossEntropy, LossKind::Jaccard, LossKind::Focal] {
            let loss = scalar(&classification_loss(kind, &logits, &wrong)?);
            assert!(loss > 0.1, "{:?} loss {}", kind, loss);
        }
        Ok(())
    }

    #[test]
    fn test_focal_discounts_easy_examples() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[2f32, 0.0], [0.0, 2.0]], &device)?;
        let labels = Tensor::new(&[0u32, 1], &device)?;
        let ce = scalar(&candle_nn::loss::cross_entropy(&logits, &labels)?);
        let focal = scalar(&focal_loss(&logits, &labels, FOCAL_GAMMA)?);
        assert!(focal < ce);

        // gamma = 0 is plain cross entropy
        let plain = scalar(&focal_loss(&logits, &labels, 0.0)?);
        assert!((plain - ce).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_one_hot_rejects_out_of_range() {
        let labels = Tensor::new(&[3u32], &Device::Cpu).unwrap();
        assert!(one_hot(&labels, 3).is_err());
    }

    #[test]
    fn test_mse() -> Result<()> {
        let device = Device::Cpu;
        let predictions = Tensor::new(&[[1f32], [3.0]], &device)?;
        let targets = Tensor::new(&[2f32, 5.0], &device)?;
        // ((1-2)^2 + (3-5)^2) / 2
        assert!((scalar(&mse(&predictions, &targets)?) - 2.5).abs() < 1e-6);
        Ok(())
    }
}
