//! Data module integration tests against on-disk fixtures

mod common;

use std::collections::BTreeSet;

use geotrain::data::{BandSet, DatasetLayout, PartitionName};
use geotrain::{DataModule, DataModuleConfig, GeoTrainError, Stage};

fn indices_of(dm: &DataModule, name: PartitionName) -> Vec<usize> {
    dm.partition(name).unwrap().indices().to_vec()
}

#[test]
fn test_resisc45_pooled_split() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    common::write_classification(dir.path(), 20, 3, 4)?;

    let mut dm = DataModule::resisc45(dir.path(), 4, 0, 0.2, 0.2, false)?;
    dm.setup()?;
    assert_eq!(dm.stage(), Stage::DataReady);
    assert_eq!(dm.num_channels()?, 3);
    assert_eq!(dm.num_classes()?, 4);
    assert_eq!(dm.max_class()?, Some(3));

    let train = indices_of(&dm, PartitionName::Train);
    let val = indices_of(&dm, PartitionName::Val);
    let test = indices_of(&dm, PartitionName::Test);
    assert_eq!((train.len(), val.len(), test.len()), (12, 4, 4));

    let all: BTreeSet<usize> = train.iter().chain(&val).chain(&test).copied().collect();
    assert_eq!(all.len(), 20);

    let loader = dm.train_dataloader()?;
    assert_eq!(loader.num_batches(), 3);
    let batches: Vec<_> = loader.iter().collect::<geotrain::Result<_>>()?;
    assert_eq!(batches.len(), 3);
    assert_eq!(batches[0].image.dims(), &[4, 3, common::SIZE, common::SIZE]);
    assert!(batches.iter().all(|b| b.label.is_some()));
    Ok(())
}

#[test]
fn test_setup_is_idempotent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    common::write_classification(dir.path(), 10, 3, 2)?;

    let mut dm = DataModule::resisc45(dir.path(), 2, 0, 0.2, 0.2, false)?;
    dm.setup()?;
    let before = indices_of(&dm, PartitionName::Val);
    dm.prepare_data()?;
    dm.setup()?;
    assert_eq!(indices_of(&dm, PartitionName::Val), before);
    Ok(())
}

#[test]
fn test_unsupervised_mode_keeps_partitions() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    common::write_classification(dir.path(), 30, 3, 3)?;

    let mut supervised = DataModule::resisc45(dir.path(), 4, 0, 0.2, 0.1, false)?;
    let mut unsupervised = DataModule::resisc45(dir.path(), 4, 0, 0.2, 0.1, true)?;
    supervised.setup()?;
    unsupervised.setup()?;

    for name in [PartitionName::Train, PartitionName::Val, PartitionName::Test] {
        assert_eq!(indices_of(&supervised, name), indices_of(&unsupervised, name));
    }

    for batch in unsupervised.val_dataloader()?.iter() {
        let batch = batch?;
        assert!(batch.label.is_none());
        assert!(matches!(batch.label(), Err(GeoTrainError::Batch(_))));
    }
    Ok(())
}

#[test]
fn test_so2sat_rgb_bands() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    for (split, n) in [("train", 6), ("validation", 3), ("test", 2)] {
        common::write_classification(&dir.path().join(split), n, 10, 17)?;
    }

    let mut dm = DataModule::so2sat(dir.path(), 2, 0, BandSet::Rgb, false)?;
    dm.setup()?;
    assert_eq!(dm.num_channels()?, 3);
    assert_eq!(dm.partition(PartitionName::Train)?.len(), 6);
    assert_eq!(dm.partition(PartitionName::Val)?.len(), 3);
    assert_eq!(dm.partition(PartitionName::Test)?.len(), 2);

    let val = dm.val_dataloader()?;
    let batch = val.iter().next().unwrap()?;
    // First kept channel is source channel 2 (B04)
    let first = batch.image.get(0)?.get(0)?.get(0)?.get(0)?.to_scalar::<f32>()?;
    assert!((first - (batch.indices[0] as f32 + 0.02)).abs() < 1e-6);

    let mut dm = DataModule::so2sat(dir.path(), 2, 0, BandSet::S2, false)?;
    dm.setup()?;
    assert_eq!(dm.num_channels()?, 10);
    Ok(())
}

#[test]
fn test_so2sat_band_count_checked() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    for (split, n) in [("train", 4), ("validation", 2), ("test", 2)] {
        common::write_classification(&dir.path().join(split), n, 4, 17)?;
    }

    let mut dm = DataModule::so2sat(dir.path(), 2, 0, BandSet::S2, false)?;
    let err = dm.setup().unwrap_err();
    assert!(matches!(err, GeoTrainError::Dataset(ref msg) if msg.contains("need 10 channels, found 4")));
    assert_eq!(dm.stage(), Stage::Uninitialized);

    // RGB only reads the first three bands
    let mut dm = DataModule::so2sat(dir.path(), 2, 0, BandSet::Rgb, false)?;
    dm.setup()?;
    assert_eq!(dm.num_channels()?, 3);
    Ok(())
}

#[test]
fn test_cyclone_group_split() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let groups: Vec<i64> = (0..10).map(|i| i / 2).collect();
    common::write_regression(&dir.path().join("train"), 10, 3, &groups)?;
    common::write_regression(&dir.path().join("test"), 4, 3, &[7, 7, 8, 8])?;

    let mut dm = DataModule::cyclone(dir.path(), 0, 2, 0)?;
    dm.setup()?;

    let train = indices_of(&dm, PartitionName::Train);
    let val = indices_of(&dm, PartitionName::Val);
    // One of five storms held out
    assert_eq!(val.len(), 2);
    assert_eq!(train.len(), 8);
    assert_eq!(groups[val[0]], groups[val[1]]);
    assert!(train.iter().all(|&i| groups[i] != groups[val[0]]));
    assert_eq!(dm.partition(PartitionName::Test)?.len(), 4);

    let batch = dm.test_dataloader()?.iter().next().unwrap()?;
    assert_eq!(batch.label()?.dtype(), candle_core::DType::F32);
    Ok(())
}

#[test]
fn test_loaders_before_setup() {
    let dm = DataModule::resisc45("does-not-exist", 2, 0, 0.2, 0.2, false).unwrap();
    for result in [dm.train_dataloader(), dm.val_dataloader(), dm.test_dataloader()] {
        assert!(matches!(
            result,
            Err(GeoTrainError::Lifecycle { stage: Stage::Uninitialized, .. })
        ));
    }
}

#[test]
fn test_missing_split_directory() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    common::write_classification(&dir.path().join("train"), 4, 10, 17)?;
    common::write_classification(&dir.path().join("test"), 4, 10, 17)?;

    let mut dm = DataModule::so2sat(dir.path(), 2, 0, BandSet::S2, false)?;
    assert!(matches!(dm.setup(), Err(GeoTrainError::Dataset(_))));
    assert_eq!(dm.stage(), Stage::Uninitialized);
    Ok(())
}

#[test]
fn test_workers_do_not_change_batches() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    common::write_classification(dir.path(), 25, 3, 5)?;

    let build = |num_workers| -> anyhow::Result<DataModule> {
        let mut dm = DataModule::from_config(DataModuleConfig {
            batch_size: 4,
            num_workers,
            seed: 7,
            ..DataModuleConfig::new(dir.path(), DatasetLayout::Pooled)
        })?;
        dm.setup()?;
        Ok(dm)
    };
    let serial = build(0)?;
    let parallel = build(3)?;

    let a = serial.train_dataloader()?;
    let b = parallel.train_dataloader()?;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (x?, y?);
        assert_eq!(x.indices, y.indices);
        let diff = (x.image - y.image)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
    }
    Ok(())
}

#[test]
fn test_drop_last() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    common::write_classification(dir.path(), 10, 3, 2)?;

    let mut dm = DataModule::from_config(DataModuleConfig {
        batch_size: 3,
        val_split_pct: 0.0,
        test_split_pct: 0.0,
        drop_last: true,
        ..DataModuleConfig::new(dir.path(), DatasetLayout::Pooled)
    })?;
    dm.setup()?;
    let loader = dm.train_dataloader()?;
    assert_eq!(loader.num_batches(), 3);
    assert!(loader.iter().all(|b| b.map(|b| b.len() == 3).unwrap_or(false)));
    Ok(())
}
