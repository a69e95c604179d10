// DataLoader - batching, shuffling, iteration

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{thread_rng, SeedableRng};
use rayon::prelude::*;
use rayon::ThreadPool;

use super::dataset::{GeoDataset, Targets};
use super::splitter::Partition;
use crate::GeoTrainError;

/// Configuration for a [`DataLoader`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    /// Number of samples per batch.
    pub batch_size: usize,
    /// Whether to reshuffle the partition order on every iteration.
    pub shuffle: bool,
    /// Whether to drop the last incomplete batch.
    pub drop_last: bool,
    /// Worker threads used to gather samples (0 = gather on the caller's thread).
    pub num_workers: usize,
    /// Seed for reproducible shuffling; iteration `k` uses `seed + k`.
    pub seed: Option<u64>,
    /// Strip labels from every batch.
    pub unsupervised: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: false,
            drop_last: false,
            num_workers: 0,
            seed: None,
            unsupervised: false,
        }
    }
}

impl LoaderConfig {
    pub fn batch_size(mut self, bs: usize) -> Self {
        self.batch_size = bs;
        self
    }

    pub fn shuffle(mut self, s: bool) -> Self {
        self.shuffle = s;
        self
    }

    pub fn drop_last(mut self, d: bool) -> Self {
        self.drop_last = d;
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn seed(mut self, s: u64) -> Self {
        self.seed = Some(s);
        self
    }

    pub fn unsupervised(mut self, u: bool) -> Self {
        self.unsupervised = u;
        self
    }
}

/// One batch of samples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Images, `[B, C, H, W]` f32
    pub image: Tensor,
    /// `[B]` u32 class indices or f32 targets; `None` in unsupervised mode
    pub label: Option<Tensor>,
    /// Dataset indices of the samples, in batch order
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// The label tensor, or an error for label-less batches
    pub fn label(&self) -> crate::Result<&Tensor> {
        self.label.as_ref().ok_or_else(|| {
            GeoTrainError::Batch("batch has no labels (unsupervised mode)".to_string())
        })
    }
}

/// Produces batches over one partition of a dataset.
///
/// Every call to [`DataLoader::iter`] starts a fresh epoch from the first
/// batch. The dataset and partition are shared read-only.
pub struct DataLoader {
    dataset: Arc<GeoDataset>,
    indices: Arc<[usize]>,
    config: LoaderConfig,
    device: Device,
    pool: Option<ThreadPool>,
    epoch: AtomicU64,
}

impl DataLoader {
    /// Create a loader over `partition`, whose indices refer to `dataset`.
    pub fn new(
        dataset: Arc<GeoDataset>,
        partition: &Partition,
        config: LoaderConfig,
        device: Device,
    ) -> crate::Result<Self> {
        if config.batch_size == 0 {
            return Err(GeoTrainError::Config("batch_size must be > 0".to_string()));
        }
        if let Some(&bad) = partition.indices().iter().find(|&&i| i >= dataset.len()) {
            return Err(GeoTrainError::Dataset(format!(
                "{} partition index {} out of range for {} samples",
                partition.name(),
                bad,
                dataset.len()
            )));
        }

        let pool = if config.num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_workers)
                .build()
                .map_err(|e| GeoTrainError::Config(format!("cannot start loader workers: {}", e)))?;
            Some(pool)
        } else {
            None
        };

        Ok(Self {
            dataset,
            indices: partition.shared_indices(),
            config,
            device,
            pool,
            epoch: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// The number of batches per epoch.
    pub fn num_batches(&self) -> usize {
        if self.config.drop_last {
            self.indices.len() / self.config.batch_size
        } else {
            self.indices.len().div_ceil(self.config.batch_size)
        }
    }

    /// Total number of samples in the partition.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Start a new epoch.
    pub fn iter(&self) -> Batches<'_> {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        let mut order = self.indices.to_vec();

        if self.config.shuffle {
            match self.config.seed {
                Some(seed) => {
                    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch));
                    order.shuffle(&mut rng);
                }
                None => {
                    let mut rng = thread_rng();
                    order.shuffle(&mut rng);
                }
            }
        }

        Batches {
            loader: self,
            order,
            cursor: 0,
        }
    }

    fn sample_pixels(&self, idx: usize) -> Vec<f32> {
        self.dataset.image(idx).iter().copied().collect()
    }

    /// Gather samples in order, fanning out to the worker pool if there is one.
    fn gather(&self, batch_indices: &[usize]) -> Vec<Vec<f32>> {
        match &self.pool {
            Some(pool) if batch_indices.len() > 1 => pool.install(|| {
                batch_indices
                    .par_iter()
                    .map(|&i| self.sample_pixels(i))
                    .collect()
            }),
            _ => batch_indices.iter().map(|&i| self.sample_pixels(i)).collect(),
        }
    }

    fn assemble(&self, batch_indices: &[usize]) -> crate::Result<Batch> {
        let (c, h, w) = self.dataset.image_shape();
        let n = batch_indices.len();

        let mut pixels = Vec::with_capacity(n * c * h * w);
        for sample in self.gather(batch_indices) {
            pixels.extend(sample);
        }
        let image = Tensor::from_vec(pixels, (n, c, h, w), &self.device)?;

        let label = if self.config.unsupervised {
            None
        } else {
            let tensor = match self.dataset.targets() {
                Targets::Classes(classes) => {
                    let data: Vec<u32> = batch_indices.iter().map(|&i| classes[i]).collect();
                    Tensor::from_vec(data, n, &self.device)?
                }
                Targets::Values(values) => {
                    let data: Vec<f32> = batch_indices.iter().map(|&i| values[i]).collect();
                    Tensor::from_vec(data, n, &self.device)?
                }
            };
            Some(tensor)
        };

        Ok(Batch {
            image,
            label,
            indices: batch_indices.to_vec(),
        })
    }
}

impl<'a> IntoIterator for &'a DataLoader {
    type Item = crate::Result<Batch>;
    type IntoIter = Batches<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy iterator over the batches of one epoch.
pub struct Batches<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    cursor: usize,
}

impl Batches<'_> {
    /// Sample order of this epoch
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    fn remaining(&self) -> usize {
        let left = self.order.len() - self.cursor;
        let bs = self.loader.config.batch_size;
        if self.loader.config.drop_last {
            left / bs
        } else {
            left.div_ceil(bs)
        }
    }
}

impl Iterator for Batches<'_> {
    type Item = crate::Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining() == 0 {
            return None;
        }

        let end = (self.cursor + self.loader.config.batch_size).min(self.order.len());
        let start = std::mem::replace(&mut self.cursor, end);

        Some(self.loader.assemble(&self.order[start..end]))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}

impl ExactSizeIterator for Batches<'_> {}
