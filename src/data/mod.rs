//! Data loading for geospatial training
pub mod datamodule;
pub mod dataset;
pub mod loader;
pub mod splitter;

pub use datamodule::{BandSet, DataModule, DataModuleConfig, DatasetLayout};
pub use dataset::{DatasetMetadata, GeoDataset, TargetKind, Targets};
pub use loader::{Batch, Batches, DataLoader, LoaderConfig};
pub use splitter::{split_groups, split_indices, Partition, PartitionName, Partitions, SplitSpec};
