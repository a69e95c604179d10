//! Training tasks and the infrastructure around them

pub mod checkpoint;
pub mod classification;
pub mod compat;
pub mod events;
pub mod losses;
pub mod metrics;
pub mod regression;
pub mod scheduler;
pub mod task;

pub use checkpoint::{read_header, Checkpoint, CheckpointHeader, CheckpointMetadata};
pub use classification::ClassificationTask;
pub use compat::{check_checkpoint, check_compatibility, CompatibilityReport, CompatibilityWarning, TargetSpec};
pub use events::{EventSink, LogEvent, LogSink, MemorySink};
pub use metrics::{Accuracy, EpochMetric, MeanLoss, Rmse};
pub use regression::RegressionTask;
pub use scheduler::{PlateauConfig, ReduceLrOnPlateau};
pub use task::{imagenet_weights, EpochSummary, OptimizerConfig, Task, MONITOR};
