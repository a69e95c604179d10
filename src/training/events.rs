//! Metric logging through an injected sink
use std::sync::Mutex;

use crate::lifecycle::Stage;

/// One logged scalar
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub stage: Stage,
    /// Metric name, e.g. "train_loss" or "val_acc"
    pub name: String,
    pub value: f64,
    /// Optimizer steps taken when the value was recorded
    pub step: usize,
}

/// Receives metric events from a task
pub trait EventSink: Send + Sync {
    fn record(&self, event: LogEvent);
}

/// Forwards events to the `log` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn record(&self, event: LogEvent) {
        log::info!("step {}: {}={:.4}", event.step, event.name, event.value);
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Values recorded under `name`, oldest first
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.events()
            .into_iter()
            .filter(|e| e.name == name)
            .map(|e| e.value)
            .collect()
    }

    pub fn last(&self, name: &str) -> Option<f64> {
        self.values(name).last().copied()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: LogEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}
