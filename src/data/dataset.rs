//! NumPy-backed imagery dataset (.npy arrays + dataset.json)
//!
//! Directory layout:
//! - `dataset.json`: [`DatasetMetadata`]
//! - `images.npy`: f32 `[N, C, H, W]`
//! - `labels.npy`: i64 `[N]` class indices, or f32 `[N]` regression targets
//! - `groups.npy`: optional i64 `[N]` group ids (e.g. storm ids)
use ndarray::{Array1, Array4, ArrayView3, Axis};
use ndarray_npy::ReadNpyExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::GeoTrainError;

pub const METADATA_FILE: &str = "dataset.json";
pub const IMAGES_FILE: &str = "images.npy";
pub const LABELS_FILE: &str = "labels.npy";
pub const GROUPS_FILE: &str = "groups.npy";

/// What `labels.npy` holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Class,
    Value,
}

/// Metadata from dataset.json
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetMetadata {
    pub name: String,
    #[serde(default)]
    pub target: TargetKind,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub bands: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// Per-sample targets
#[derive(Debug, Clone)]
pub enum Targets {
    Classes(Array1<u32>),
    Values(Array1<f32>),
}

impl Targets {
    pub fn len(&self) -> usize {
        match self {
            Targets::Classes(c) => c.len(),
            Targets::Values(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            Targets::Classes(_) => TargetKind::Class,
            Targets::Values(_) => TargetKind::Value,
        }
    }
}

/// Dataset held in memory, loaded from NumPy .npy files
#[derive(Debug, Clone)]
pub struct GeoDataset {
    images: Array4<f32>, // [N, C, H, W]
    targets: Targets,    // [N]
    groups: Option<Vec<u32>>,
    metadata: DatasetMetadata,
}

impl GeoDataset {
    /// Build from in-memory arrays
    pub fn new(images: Array4<f32>, targets: Targets, metadata: DatasetMetadata) -> crate::Result<Self> {
        if images.len_of(Axis(0)) != targets.len() {
            return Err(GeoTrainError::Dataset(format!(
                "{}: {} images but {} labels",
                metadata.name,
                images.len_of(Axis(0)),
                targets.len()
            )));
        }

        if let (Targets::Classes(classes), false) = (&targets, metadata.classes.is_empty()) {
            let num_classes = metadata.classes.len() as u32;
            if let Some(bad) = classes.iter().find(|&&c| c >= num_classes) {
                return Err(GeoTrainError::Dataset(format!(
                    "{}: label {} out of range for {} classes",
                    metadata.name, bad, num_classes
                )));
            }
        }

        if !metadata.bands.is_empty() && metadata.bands.len() != images.len_of(Axis(1)) {
            return Err(GeoTrainError::Dataset(format!(
                "{}: metadata lists {} bands, images have {} channels",
                metadata.name,
                metadata.bands.len(),
                images.len_of(Axis(1))
            )));
        }

        Ok(Self {
            images,
            targets,
            groups: None,
            metadata,
        })
    }

    /// Attach a group id per sample
    pub fn with_groups(mut self, groups: Vec<u32>) -> crate::Result<Self> {
        if groups.len() != self.len() {
            return Err(GeoTrainError::Dataset(format!(
                "{}: {} group ids for {} samples",
                self.metadata.name,
                groups.len(),
                self.len()
            )));
        }
        self.groups = Some(groups);
        Ok(self)
    }

    /// Load from a directory containing dataset.json and the .npy arrays
    pub fn from_directory<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let dir = path.as_ref();

        log::info!("Loading dataset from: {:?}", dir);

        let metadata_path = dir.join(METADATA_FILE);
        let metadata: DatasetMetadata = if metadata_path.exists() {
            let reader = BufReader::new(File::open(&metadata_path)?);
            serde_json::from_reader(reader)?
        } else {
            log::warn!("{} not found in {:?}, assuming class labels", METADATA_FILE, dir);
            DatasetMetadata {
                name: dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "unknown".to_string()),
                target: TargetKind::Class,
                classes: Vec::new(),
                bands: Vec::new(),
                description: String::new(),
            }
        };

        let images = Array4::<f32>::read_npy(File::open(dir.join(IMAGES_FILE))?)?;
        log::info!("Loaded images: shape {:?}", images.shape());

        let labels_file = File::open(dir.join(LABELS_FILE))?;
        let targets = match metadata.target {
            TargetKind::Class => {
                let raw = Array1::<i64>::read_npy(labels_file)?;
                Targets::Classes(Array1::from(to_u32(&raw, "class label", &metadata.name)?))
            }
            TargetKind::Value => Targets::Values(Array1::<f32>::read_npy(labels_file)?),
        };

        let groups_path = dir.join(GROUPS_FILE);
        let groups = if groups_path.exists() {
            let raw = Array1::<i64>::read_npy(File::open(&groups_path)?)?;
            Some(to_u32(&raw, "group id", &metadata.name)?)
        } else {
            None
        };

        let mut dataset = Self::new(images, targets, metadata)?;
        if let Some(groups) = groups {
            dataset = dataset.with_groups(groups)?;
        }

        log::info!(
            "Dataset {} loaded: {} samples, {} channels, {:?} targets",
            dataset.metadata.name,
            dataset.len(),
            dataset.num_channels(),
            dataset.targets.kind()
        );

        Ok(dataset)
    }

    /// Keep only the given channels, in the given order
    pub fn select_bands(&self, bands: &[usize]) -> crate::Result<Self> {
        let channels = self.num_channels();
        if let Some(&bad) = bands.iter().find(|&&b| b >= channels) {
            return Err(GeoTrainError::Dataset(format!(
                "{}: band index {} out of range for {} channels",
                self.metadata.name, bad, channels
            )));
        }

        let mut metadata = self.metadata.clone();
        if !metadata.bands.is_empty() {
            metadata.bands = bands.iter().map(|&b| self.metadata.bands[b].clone()).collect();
        }

        Ok(Self {
            images: self.images.select(Axis(1), bands),
            targets: self.targets.clone(),
            groups: self.groups.clone(),
            metadata,
        })
    }

    /// Get number of samples
    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_channels(&self) -> usize {
        self.images.len_of(Axis(1))
    }

    /// `(C, H, W)` of a single sample
    pub fn image_shape(&self) -> (usize, usize, usize) {
        let s = self.images.shape();
        (s[1], s[2], s[3])
    }

    pub fn num_classes(&self) -> usize {
        self.metadata.classes.len()
    }

    /// Largest class label, `None` for regression targets or an empty dataset
    pub fn max_class(&self) -> Option<u32> {
        match &self.targets {
            Targets::Classes(classes) => classes.iter().copied().max(),
            Targets::Values(_) => None,
        }
    }

    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    pub fn targets(&self) -> &Targets {
        &self.targets
    }

    pub fn groups(&self) -> Option<&[u32]> {
        self.groups.as_deref()
    }

    /// Image at index
    pub fn image(&self, idx: usize) -> ArrayView3<f32> {
        self.images.index_axis(Axis(0), idx)
    }
}

/// Narrow on-disk i64 ids, rejecting negatives and values past `u32::MAX`
fn to_u32(raw: &Array1<i64>, what: &str, dataset: &str) -> crate::Result<Vec<u32>> {
    raw.iter()
        .map(|&v| {
            u32::try_from(v).map_err(|_| {
                GeoTrainError::Dataset(format!("{}: {} {} is not a valid u32", dataset, what, v))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn metadata(classes: usize, bands: usize) -> DatasetMetadata {
        DatasetMetadata {
            name: "toy".to_string(),
            target: TargetKind::Class,
            classes: (0..classes).map(|c| format!("class_{}", c)).collect(),
            bands: (0..bands).map(|b| format!("B{:02}", b + 1)).collect(),
            description: String::new(),
        }
    }

    #[test]
    fn test_metadata_deserialization() {
        let json = r#"{
            "name": "cyclone",
            "target": "value",
            "description": "Tropical cyclone wind speed"
        }"#;

        let metadata: DatasetMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.target, TargetKind::Value);
        assert!(metadata.classes.is_empty());
        assert!(metadata.bands.is_empty());
    }

    #[test]
    fn test_label_count_mismatch() {
        let images = Array4::<f32>::zeros((4, 3, 2, 2));
        let targets = Targets::Classes(Array1::from(vec![0, 1, 0]));
        assert!(GeoDataset::new(images, targets, metadata(2, 3)).is_err());
    }

    #[test]
    fn test_label_out_of_range() {
        let images = Array4::<f32>::zeros((2, 3, 2, 2));
        let targets = Targets::Classes(Array1::from(vec![0, 5]));
        assert!(GeoDataset::new(images, targets, metadata(2, 3)).is_err());
    }

    #[test]
    fn test_select_bands() {
        // Channel c of every pixel holds the value c
        let images = Array::from_shape_fn((2, 4, 2, 2), |(_, c, _, _)| c as f32);
        let targets = Targets::Classes(Array1::from(vec![0, 1]));
        let dataset = GeoDataset::new(images, targets, metadata(2, 4)).unwrap();

        let rgb = dataset.select_bands(&[2, 1, 0]).unwrap();
        assert_eq!(rgb.num_channels(), 3);
        assert_eq!(rgb.image(1)[[0, 0, 0]], 2.0);
        assert_eq!(rgb.image(1)[[2, 1, 1]], 0.0);
        assert_eq!(rgb.metadata().bands, vec!["B03", "B02", "B01"]);
        assert_eq!(dataset.num_channels(), 4);

        assert!(dataset.select_bands(&[7]).is_err());
    }

    #[test]
    fn test_groups_length() {
        let images = Array4::<f32>::zeros((3, 1, 2, 2));
        let targets = Targets::Values(Array1::from(vec![1.0, 2.0, 3.0]));
        let mut meta = metadata(0, 0);
        meta.target = TargetKind::Value;
        let dataset = GeoDataset::new(images, targets, meta).unwrap();

        assert!(dataset.clone().with_groups(vec![1, 2]).is_err());
        let grouped = dataset.with_groups(vec![1, 1, 2]).unwrap();
        assert_eq!(grouped.groups(), Some(&[1, 1, 2][..]));
        assert_eq!(grouped.max_class(), None);
    }

    #[test]
    fn test_max_class() {
        let images = Array4::<f32>::zeros((3, 1, 2, 2));
        let targets = Targets::Classes(Array1::from(vec![3, 40, 7]));
        // No class names, so the range check in `new` is skipped
        let dataset = GeoDataset::new(images, targets, metadata(0, 1)).unwrap();
        assert_eq!(dataset.max_class(), Some(40));

        let empty = Targets::Classes(Array1::from(Vec::<u32>::new()));
        let dataset = GeoDataset::new(Array4::zeros((0, 1, 2, 2)), empty, metadata(0, 1)).unwrap();
        assert_eq!(dataset.max_class(), None);
    }

    fn write_split(labels: &[i64], groups: Option<&[i64]>) -> tempfile::TempDir {
        use ndarray_npy::WriteNpyExt;

        let dir = tempfile::tempdir().unwrap();
        let n = labels.len();
        Array4::<f32>::zeros((n, 1, 2, 2))
            .write_npy(File::create(dir.path().join(IMAGES_FILE)).unwrap())
            .unwrap();
        Array1::from(labels.to_vec())
            .write_npy(File::create(dir.path().join(LABELS_FILE)).unwrap())
            .unwrap();
        if let Some(groups) = groups {
            Array1::from(groups.to_vec())
                .write_npy(File::create(dir.path().join(GROUPS_FILE)).unwrap())
                .unwrap();
        }
        dir
    }

    #[test]
    fn test_from_directory_rejects_wide_labels() {
        let dir = write_split(&[0, 1 << 32], None);
        let err = GeoDataset::from_directory(dir.path()).unwrap_err();
        assert!(matches!(err, GeoTrainError::Dataset(ref msg) if msg.contains("class label 4294967296")));

        let dir = write_split(&[0, -1], None);
        assert!(matches!(GeoDataset::from_directory(dir.path()), Err(GeoTrainError::Dataset(_))));
    }

    #[test]
    fn test_from_directory_rejects_bad_groups() {
        let dir = write_split(&[0, 1], Some(&[3, -1]));
        let err = GeoDataset::from_directory(dir.path()).unwrap_err();
        assert!(matches!(err, GeoTrainError::Dataset(ref msg) if msg.contains("group id -1")));

        let dir = write_split(&[0, 1], Some(&[3, 3]));
        let dataset = GeoDataset::from_directory(dir.path()).unwrap();
        assert_eq!(dataset.groups(), Some(&[3, 3][..]));
        assert_eq!(dataset.max_class(), Some(1));
    }
}
