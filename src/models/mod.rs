//! Backbones used by the training tasks
//!
//! The real model zoo lives outside this crate. [`ResNetProbe`] is a small
//! reference backbone that keeps the ResNet parameter names of the stem and
//! head (`conv1.weight`, `fc.weight`, `fc.bias`) and the feature width of the
//! architecture it stands in for, which is what checkpoint compatibility is
//! judged on.
use std::collections::BTreeMap;

use candle_core::{Result, Tensor};
use candle_nn::{conv2d_no_bias, linear, Conv2d, Conv2dConfig, Linear, Module, VarBuilder};

use crate::config::ModelKind;

pub mod loader;

/// Stem convolution; its second dimension is the input channel count
pub const STEM_WEIGHT: &str = "conv1.weight";

/// Prefix of the classification/regression head parameters
pub const HEAD_PREFIX: &str = "fc.";

const STEM_CHANNELS: usize = 64;
const STEM_KERNEL: usize = 7;

/// Opaque image model: `[B, C, H, W]` images to `[B, num_outputs]` outputs
pub trait Backbone: Send + Sync {
    fn forward(&self, images: &Tensor) -> Result<Tensor>;

    fn architecture(&self) -> ModelKind;
}

/// Parameter names and shapes a backbone of `kind` is built with
pub fn signature(kind: ModelKind, in_channels: usize, num_outputs: usize) -> BTreeMap<String, Vec<usize>> {
    let features = kind.feature_dim();
    BTreeMap::from([
        (STEM_WEIGHT.to_string(), vec![STEM_CHANNELS, in_channels, STEM_KERNEL, STEM_KERNEL]),
        ("proj.weight".to_string(), vec![features, STEM_CHANNELS]),
        ("proj.bias".to_string(), vec![features]),
        ("fc.weight".to_string(), vec![num_outputs, features]),
        ("fc.bias".to_string(), vec![num_outputs]),
    ])
}

/// Stem convolution, global average pooling, projection to the
/// architecture's feature width, linear head.
pub struct ResNetProbe {
    kind: ModelKind,
    conv1: Conv2d,
    proj: Linear,
    fc: Linear,
}

impl ResNetProbe {
    pub fn new(kind: ModelKind, in_channels: usize, num_outputs: usize, vb: VarBuilder) -> Result<Self> {
        let stem_config = Conv2dConfig {
            padding: 3,
            stride: 2,
            ..Default::default()
        };
        let conv1 = conv2d_no_bias(in_channels, STEM_CHANNELS, STEM_KERNEL, stem_config, vb.pp("conv1"))?;
        let proj = linear(STEM_CHANNELS, kind.feature_dim(), vb.pp("proj"))?;
        let fc = linear(kind.feature_dim(), num_outputs, vb.pp("fc"))?;

        Ok(Self {
            kind,
            conv1,
            proj,
            fc,
        })
    }
}

impl Backbone for ResNetProbe {
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let x = self.conv1.forward(images)?.relu()?;
        // Global average pool: [B, 64, H', W'] -> [B, 64]
        let x = x.flatten_from(2)?.mean(2)?;
        let x = self.proj.forward(&x)?.relu()?;
        self.fc.forward(&x)
    }

    fn architecture(&self) -> ModelKind {
        self.kind
    }
}
