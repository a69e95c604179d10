//! Explicit lifecycle shared by data modules and tasks
//!
//! Data modules move `Uninitialized -> DataReady`. Tasks start
//! `Uninitialized`, become `DataReady` once attached to a set-up data module,
//! enter `Training`/`Validating`/`Testing` on the first step of an epoch,
//! return to `DataReady` at epoch end and finish in `Complete`.
use std::fmt;

use crate::{GeoTrainError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Uninitialized,
    DataReady,
    Training,
    Validating,
    Testing,
    Complete,
}

impl Stage {
    /// Prefix used for logged metric names (`train_loss`, `val_acc`, ...)
    pub fn metric_prefix(self) -> &'static str {
        match self {
            Stage::Training => "train",
            Stage::Validating => "val",
            Stage::Testing => "test",
            Stage::Uninitialized | Stage::DataReady | Stage::Complete => "",
        }
    }

    /// Whether a step of the `target` stage may run from `self`.
    pub fn can_step_into(self, target: Stage) -> bool {
        self == Stage::DataReady || self == target
    }

    /// Move into `target` for a step, or fail with a lifecycle error.
    pub fn enter(&mut self, target: Stage, action: &'static str) -> Result<()> {
        if !self.can_step_into(target) {
            return Err(GeoTrainError::Lifecycle {
                action,
                stage: *self,
            });
        }
        *self = target;
        Ok(())
    }

    /// Close an epoch of `target`. An epoch with no steps is allowed.
    pub fn leave(&mut self, target: Stage, action: &'static str) -> Result<()> {
        if *self != target && *self != Stage::DataReady {
            return Err(GeoTrainError::Lifecycle {
                action,
                stage: *self,
            });
        }
        *self = Stage::DataReady;
        Ok(())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Uninitialized => "uninitialized",
            Stage::DataReady => "data ready",
            Stage::Training => "training",
            Stage::Validating => "validating",
            Stage::Testing => "testing",
            Stage::Complete => "complete",
        };
        f.write_str(name)
    }
}
