//! Train/validation/test partitioning
//!
//! Rounding policy: `len(val) = floor(n * val_split_pct)`,
//! `len(test) = floor(n * test_split_pct)`, train takes the remainder.
//! The product is nudged by `ROUNDING_TOLERANCE` first so fractions that are
//! not exactly representable in binary (0.29, 0.57, ...) still land on the
//! intended count.
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::GeoTrainError;

const ROUNDING_TOLERANCE: f64 = 1e-9;

/// Which subset a partition holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionName {
    Train,
    Val,
    Test,
}

impl fmt::Display for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionName::Train => "train",
            PartitionName::Val => "val",
            PartitionName::Test => "test",
        };
        f.write_str(name)
    }
}

/// Immutable, ascending set of sample indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    name: PartitionName,
    indices: Arc<[usize]>,
}

impl Partition {
    pub fn new(name: PartitionName, mut indices: Vec<usize>) -> Self {
        indices.sort_unstable();
        Self {
            name,
            indices: indices.into(),
        }
    }

    /// Every index in `0..n`
    pub fn full(name: PartitionName, n: usize) -> Self {
        Self::new(name, (0..n).collect())
    }

    pub fn name(&self) -> PartitionName {
        self.name
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Shared handle on the index sequence
    pub fn shared_indices(&self) -> Arc<[usize]> {
        Arc::clone(&self.indices)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// The three partitions of one dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partitions {
    pub train: Partition,
    pub val: Partition,
    pub test: Partition,
}

/// Split fractions plus shuffling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitSpec {
    pub val_split_pct: f64,
    pub test_split_pct: f64,
    pub shuffle: bool,
    pub seed: u64,
}

impl Default for SplitSpec {
    fn default() -> Self {
        Self {
            val_split_pct: 0.2,
            test_split_pct: 0.2,
            shuffle: true,
            seed: 0,
        }
    }
}

impl SplitSpec {
    pub fn new(val_split_pct: f64, test_split_pct: f64) -> Self {
        Self {
            val_split_pct,
            test_split_pct,
            ..Default::default()
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Both fractions in [0, 1) with a sum below 1
    pub fn validate(&self) -> crate::Result<()> {
        for (name, pct) in [
            ("val_split_pct", self.val_split_pct),
            ("test_split_pct", self.test_split_pct),
        ] {
            if !(0.0..1.0).contains(&pct) {
                return Err(GeoTrainError::Config(format!(
                    "{} must be in [0, 1), got {}",
                    name, pct
                )));
            }
        }
        if self.val_split_pct + self.test_split_pct >= 1.0 {
            return Err(GeoTrainError::Config(format!(
                "val_split_pct + test_split_pct must be < 1, got {} + {}",
                self.val_split_pct, self.test_split_pct
            )));
        }
        Ok(())
    }

    /// `(train, val, test)` lengths for `n` samples
    pub fn lengths(&self, n: usize) -> (usize, usize, usize) {
        let val = fraction_of(n, self.val_split_pct);
        let test = fraction_of(n, self.test_split_pct);
        // Clamped so an unvalidated SplitSpec cannot underflow
        let val = val.min(n);
        let test = test.min(n - val);
        (n - val - test, val, test)
    }
}

fn fraction_of(n: usize, pct: f64) -> usize {
    (n as f64 * pct + ROUNDING_TOLERANCE).floor() as usize
}

/// Partition `0..n` into train/val/test.
pub fn split_indices(n: usize, spec: &SplitSpec) -> crate::Result<Partitions> {
    spec.validate()?;

    let mut order: Vec<usize> = (0..n).collect();
    if spec.shuffle {
        let mut rng = StdRng::seed_from_u64(spec.seed);
        order.shuffle(&mut rng);
    }

    let (train_len, val_len, _) = spec.lengths(n);
    let test = order.split_off(train_len + val_len);
    let val = order.split_off(train_len);

    let partitions = Partitions {
        train: Partition::new(PartitionName::Train, order),
        val: Partition::new(PartitionName::Val, val),
        test: Partition::new(PartitionName::Test, test),
    };

    log::debug!(
        "Split {} samples: {} train, {} val, {} test",
        n,
        partitions.train.len(),
        partitions.val.len(),
        partitions.test.len()
    );

    Ok(partitions)
}

/// Split samples into (train, val) so that every group lands on one side.
///
/// `floor(num_groups * val_pct)` randomly chosen groups form the validation
/// partition.
pub fn split_groups(groups: &[u32], val_pct: f64, seed: u64) -> crate::Result<(Partition, Partition)> {
    SplitSpec::new(val_pct, 0.0).validate()?;

    let mut unique: Vec<u32> = groups.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    let mut rng = StdRng::seed_from_u64(seed);
    unique.shuffle(&mut rng);

    let num_val = fraction_of(unique.len(), val_pct);
    let val_groups: BTreeSet<u32> = unique.into_iter().take(num_val).collect();

    let (val, train): (Vec<usize>, Vec<usize>) =
        (0..groups.len()).partition(|&i| val_groups.contains(&groups[i]));

    log::debug!(
        "Group split: {} groups held out, {} train / {} val samples",
        val_groups.len(),
        train.len(),
        val.len()
    );

    Ok((
        Partition::new(PartitionName::Train, train),
        Partition::new(PartitionName::Val, val),
    ))
}
