//! Outcome event bus: trait for publishing experiment outcomes to
//! downstream notification and reporting consumers.
//!
//! The experiment manager accepts an `Arc<dyn OutcomeSink>`.

use crate::types::{OutcomeEvent, OutcomeKind};
use parking_lot::Mutex;
use std::sync::Arc;

/// Trait for publishing outcome events.
pub trait OutcomeSink: Send + Sync {
    fn emit(&self, event: OutcomeEvent);
}

/// No-op sink for callers that don't consume outcomes.
pub struct NoOpSink;

impl OutcomeSink for NoOpSink {
    fn emit(&self, _event: OutcomeEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<OutcomeEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<OutcomeEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_kind(&self, kind: OutcomeKind) -> usize {
        self.events.lock().iter().filter(|e| e.outcome == kind).count()
    }
}

impl OutcomeSink for CaptureSink {
    fn emit(&self, event: OutcomeEvent) {
        tracing::debug!(
            experiment_id = %event.experiment_id,
            outcome = ?event.outcome,
            "outcome event captured"
        );
        self.events.lock().push(event);
    }
}

pub fn noop_sink() -> Arc<dyn OutcomeSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
