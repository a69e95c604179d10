//! Data modules: on-disk layout -> partitions -> batch loaders
//!
//! A data module owns its datasets and partitions. `setup()` builds them
//! once; the three loader accessors hand out fresh [`DataLoader`]s that share
//! the immutable partitions.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use candle_core::Device;

use super::dataset::{GeoDataset, TargetKind, IMAGES_FILE, LABELS_FILE};
use super::loader::{DataLoader, LoaderConfig};
use super::splitter::{split_groups, split_indices, Partition, PartitionName, SplitSpec};
use crate::lifecycle::Stage;
use crate::GeoTrainError;

/// Fraction of cyclone storms held out for validation
pub const CYCLONE_VAL_GROUP_PCT: f64 = 0.2;

/// How a dataset is laid out under its root directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetLayout {
    /// One directory, split by percentages
    Pooled,
    /// `train/`, `validation/` and `test/` directories
    PreSplit,
    /// `train/` and `test/`; validation is carved out of train by group
    TrainTest,
}

/// Sentinel-2 band subsets for So2Sat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandSet {
    /// B04, B03, B02
    Rgb,
    /// All 10 Sentinel-2 bands
    S2,
}

impl BandSet {
    pub fn parse(value: &str) -> crate::Result<Self> {
        match value {
            "rgb" => Ok(BandSet::Rgb),
            "s2" => Ok(BandSet::S2),
            other => Err(GeoTrainError::Config(format!(
                "band set must be 'rgb' or 's2', got '{}'",
                other
            ))),
        }
    }

    /// Channel indices to keep, `None` for all
    pub fn indices(self) -> Option<Vec<usize>> {
        match self {
            BandSet::Rgb => Some(vec![2, 1, 0]),
            BandSet::S2 => None,
        }
    }

    pub fn num_channels(self) -> usize {
        match self {
            BandSet::Rgb => 3,
            BandSet::S2 => 10,
        }
    }
}

/// Data module configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DataModuleConfig {
    pub root: PathBuf,
    pub layout: DatasetLayout,
    pub batch_size: usize,
    pub num_workers: usize,
    pub val_split_pct: f64,
    pub test_split_pct: f64,
    pub unsupervised_mode: bool,
    pub seed: u64,
    pub drop_last: bool,
    /// Channels to keep, in order
    pub bands: Option<Vec<usize>>,
    /// Named band set; every loaded split must end up with its channel count
    pub band_set: Option<BandSet>,
}

impl DataModuleConfig {
    pub fn new(root: impl Into<PathBuf>, layout: DatasetLayout) -> Self {
        Self {
            root: root.into(),
            layout,
            batch_size: 32,
            num_workers: 0,
            val_split_pct: 0.2,
            test_split_pct: 0.2,
            unsupervised_mode: false,
            seed: 0,
            drop_last: false,
            bands: None,
            band_set: None,
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size == 0 {
            return Err(GeoTrainError::Config("batch_size must be > 0".to_string()));
        }
        match self.layout {
            DatasetLayout::Pooled => SplitSpec::new(self.val_split_pct, self.test_split_pct).validate(),
            DatasetLayout::TrainTest => SplitSpec::new(self.val_split_pct, 0.0).validate(),
            DatasetLayout::PreSplit => Ok(()),
        }
    }
}

struct Split {
    dataset: Arc<GeoDataset>,
    partition: Partition,
}

struct Splits {
    train: Split,
    val: Split,
    test: Split,
}

/// Serves train/val/test loaders for one dataset
pub struct DataModule {
    config: DataModuleConfig,
    device: Device,
    stage: Stage,
    prepared: bool,
    splits: Option<Splits>,
    train_loaders: AtomicU64,
}

impl DataModule {
    pub fn from_config(config: DataModuleConfig) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            device: Device::Cpu,
            stage: Stage::Uninitialized,
            prepared: false,
            splits: None,
            train_loaders: AtomicU64::new(0),
        })
    }

    /// RESISC45 scene classification: one directory, percentage split
    pub fn resisc45(
        root: impl Into<PathBuf>,
        batch_size: usize,
        num_workers: usize,
        val_split_pct: f64,
        test_split_pct: f64,
        unsupervised_mode: bool,
    ) -> crate::Result<Self> {
        Self::from_config(DataModuleConfig {
            batch_size,
            num_workers,
            val_split_pct,
            test_split_pct,
            unsupervised_mode,
            ..DataModuleConfig::new(root, DatasetLayout::Pooled)
        })
    }

    /// So2Sat local climate zones: fixed train/validation/test files
    pub fn so2sat(
        root: impl Into<PathBuf>,
        batch_size: usize,
        num_workers: usize,
        bands: BandSet,
        unsupervised_mode: bool,
    ) -> crate::Result<Self> {
        Self::from_config(DataModuleConfig {
            batch_size,
            num_workers,
            unsupervised_mode,
            bands: bands.indices(),
            band_set: Some(bands),
            ..DataModuleConfig::new(root, DatasetLayout::PreSplit)
        })
    }

    /// Tropical cyclone wind speed: validation storms drawn from train
    pub fn cyclone(
        root: impl Into<PathBuf>,
        seed: u64,
        batch_size: usize,
        num_workers: usize,
    ) -> crate::Result<Self> {
        Self::from_config(DataModuleConfig {
            batch_size,
            num_workers,
            seed,
            val_split_pct: CYCLONE_VAL_GROUP_PCT,
            test_split_pct: 0.0,
            ..DataModuleConfig::new(root, DatasetLayout::TrainTest)
        })
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn config(&self) -> &DataModuleConfig {
        &self.config
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn required_dirs(&self) -> Vec<PathBuf> {
        let root = &self.config.root;
        match self.config.layout {
            DatasetLayout::Pooled => vec![root.clone()],
            DatasetLayout::PreSplit => vec![root.join("train"), root.join("validation"), root.join("test")],
            DatasetLayout::TrainTest => vec![root.join("train"), root.join("test")],
        }
    }

    /// Check the on-disk layout. Idempotent.
    pub fn prepare_data(&mut self) -> crate::Result<()> {
        if self.prepared {
            return Ok(());
        }

        for dir in self.required_dirs() {
            for file in [IMAGES_FILE, LABELS_FILE] {
                if !dir.join(file).is_file() {
                    return Err(GeoTrainError::Dataset(format!(
                        "{} not found in {:?}",
                        file, dir
                    )));
                }
            }
        }

        log::debug!("Dataset layout {:?} found under {:?}", self.config.layout, self.config.root);
        self.prepared = true;
        Ok(())
    }

    fn load(&self, dir: &Path) -> crate::Result<Arc<GeoDataset>> {
        let dataset = GeoDataset::from_directory(dir)?;
        let dataset = match &self.config.bands {
            Some(bands) => dataset.select_bands(bands)?,
            None => dataset,
        };
        if let Some(band_set) = self.config.band_set {
            if dataset.num_channels() != band_set.num_channels() {
                return Err(GeoTrainError::Dataset(format!(
                    "{:?}: {:?} bands need {} channels, found {}",
                    dir,
                    band_set,
                    band_set.num_channels(),
                    dataset.num_channels()
                )));
            }
        }
        Ok(Arc::new(dataset))
    }

    /// Load datasets and build partitions. Idempotent.
    pub fn setup(&mut self) -> crate::Result<()> {
        if self.stage == Stage::DataReady {
            return Ok(());
        }
        self.prepare_data()?;

        let root = self.config.root.clone();
        let splits = match self.config.layout {
            DatasetLayout::Pooled => {
                let dataset = self.load(&root)?;
                let spec = SplitSpec::new(self.config.val_split_pct, self.config.test_split_pct)
                    .seed(self.config.seed);
                let parts = split_indices(dataset.len(), &spec)?;
                Splits {
                    train: Split { dataset: Arc::clone(&dataset), partition: parts.train },
                    val: Split { dataset: Arc::clone(&dataset), partition: parts.val },
                    test: Split { dataset, partition: parts.test },
                }
            }
            DatasetLayout::PreSplit => {
                let train = self.load(&root.join("train"))?;
                let val = self.load(&root.join("validation"))?;
                let test = self.load(&root.join("test"))?;
                Splits {
                    train: Split { partition: Partition::full(PartitionName::Train, train.len()), dataset: train },
                    val: Split { partition: Partition::full(PartitionName::Val, val.len()), dataset: val },
                    test: Split { partition: Partition::full(PartitionName::Test, test.len()), dataset: test },
                }
            }
            DatasetLayout::TrainTest => {
                let train = self.load(&root.join("train"))?;
                let test = self.load(&root.join("test"))?;

                // Without group ids every sample is its own group
                let groups: Vec<u32> = match train.groups() {
                    Some(groups) => groups.to_vec(),
                    None => (0..train.len() as u32).collect(),
                };
                let (train_part, val_part) = split_groups(&groups, self.config.val_split_pct, self.config.seed)?;
                Splits {
                    train: Split { dataset: Arc::clone(&train), partition: train_part },
                    val: Split { dataset: train, partition: val_part },
                    test: Split { partition: Partition::full(PartitionName::Test, test.len()), dataset: test },
                }
            }
        };

        let channels = splits.train.dataset.num_channels();
        for split in [&splits.val, &splits.test] {
            if split.dataset.num_channels() != channels {
                return Err(GeoTrainError::Dataset(format!(
                    "{} split has {} channels, train has {}",
                    split.partition.name(),
                    split.dataset.num_channels(),
                    channels
                )));
            }
        }

        log::info!(
            "Data ready: {} train, {} val, {} test samples{}",
            splits.train.partition.len(),
            splits.val.partition.len(),
            splits.test.partition.len(),
            if self.config.unsupervised_mode { " (unsupervised)" } else { "" }
        );

        self.splits = Some(splits);
        self.stage = Stage::DataReady;
        Ok(())
    }

    fn splits(&self, action: &'static str) -> crate::Result<&Splits> {
        self.splits.as_ref().ok_or(GeoTrainError::Lifecycle {
            action,
            stage: self.stage,
        })
    }

    fn loader(&self, split: &Split, shuffle: bool, seed: u64) -> crate::Result<DataLoader> {
        let config = LoaderConfig::default()
            .batch_size(self.config.batch_size)
            .num_workers(self.config.num_workers)
            .drop_last(self.config.drop_last)
            .shuffle(shuffle)
            .seed(seed)
            .unsupervised(self.config.unsupervised_mode);
        DataLoader::new(Arc::clone(&split.dataset), &split.partition, config, self.device.clone())
    }

    /// Shuffled loader over the train partition
    pub fn train_dataloader(&self) -> crate::Result<DataLoader> {
        let split = &self.splits("build the train loader")?.train;
        // Each loader gets its own shuffle stream
        let n = self.train_loaders.fetch_add(1, Ordering::Relaxed);
        let seed = self.config.seed.wrapping_add(n.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        self.loader(split, true, seed)
    }

    pub fn val_dataloader(&self) -> crate::Result<DataLoader> {
        let split = &self.splits("build the val loader")?.val;
        self.loader(split, false, self.config.seed)
    }

    pub fn test_dataloader(&self) -> crate::Result<DataLoader> {
        let split = &self.splits("build the test loader")?.test;
        self.loader(split, false, self.config.seed)
    }

    /// Partition by name, once set up
    pub fn partition(&self, name: PartitionName) -> crate::Result<&Partition> {
        let splits = self.splits("read partitions")?;
        Ok(match name {
            PartitionName::Train => &splits.train.partition,
            PartitionName::Val => &splits.val.partition,
            PartitionName::Test => &splits.test.partition,
        })
    }

    pub fn num_channels(&self) -> crate::Result<usize> {
        Ok(self.splits("read channels")?.train.dataset.num_channels())
    }

    pub fn num_classes(&self) -> crate::Result<usize> {
        Ok(self.splits("read classes")?.train.dataset.num_classes())
    }

    /// Largest class label over all three splits, `None` without class labels
    pub fn max_class(&self) -> crate::Result<Option<u32>> {
        let splits = self.splits("read class labels")?;
        Ok([&splits.train, &splits.val, &splits.test]
            .iter()
            .filter_map(|split| split.dataset.max_class())
            .max())
    }

    /// Whether the dataset carries class indices or scalar values
    pub fn target_kind(&self) -> crate::Result<TargetKind> {
        Ok(self.splits("read targets")?.train.dataset.targets().kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_sets() {
        assert_eq!(BandSet::parse("rgb").unwrap(), BandSet::Rgb);
        assert_eq!(BandSet::Rgb.indices(), Some(vec![2, 1, 0]));
        assert_eq!(BandSet::S2.indices(), None);
        assert_eq!(BandSet::S2.num_channels(), 10);
        assert!(BandSet::parse("s1").is_err());
    }

    #[test]
    fn test_invalid_split_rejected_at_construction() {
        assert!(DataModule::resisc45("missing", 2, 0, 0.6, 0.6, false).is_err());
        assert!(DataModule::resisc45("missing", 0, 0, 0.2, 0.2, false).is_err());
    }

    #[test]
    fn test_loader_before_setup() {
        let dm = DataModule::resisc45("missing", 2, 0, 0.2, 0.2, false).unwrap();
        assert_eq!(dm.stage(), Stage::Uninitialized);
        let err = dm.train_dataloader().err().unwrap();
        assert!(matches!(err, GeoTrainError::Lifecycle { stage: Stage::Uninitialized, .. }));
    }

    #[test]
    fn test_prepare_missing_layout() {
        let mut dm = DataModule::cyclone("does/not/exist", 0, 1, 0).unwrap();
        assert!(matches!(dm.prepare_data(), Err(GeoTrainError::Dataset(_))));
        assert!(dm.setup().is_err());
        assert_eq!(dm.stage(), Stage::Uninitialized);
    }
}
