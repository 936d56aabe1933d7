use std::collections::HashMap;

use crate::types::{ActivityId, Value};

/// Outcome of a locally executed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityState {
    Pending,
    Done(Value),
    /// The handler did not return a value.
    Failed(String),
}

/// Results of operations peers invoked on the broker, kept until polled.
///
/// Polling does not remove an entry.
#[derive(Debug, Default)]
pub struct ActivityStore {
    activities: HashMap<ActivityId, ActivityState>,
}

impl ActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `id` was accepted and is executing.
    pub fn mark_pending(&mut self, id: ActivityId) {
        self.activities.insert(id, ActivityState::Pending);
    }

    /// Store the handler's return value for `id`.
    pub fn complete(&mut self, id: ActivityId, value: Value) {
        self.activities.insert(id, ActivityState::Done(value));
    }

    /// Record that the handler for `id` died without a result.
    pub fn fail(&mut self, id: ActivityId, reason: String) {
        self.activities.insert(id, ActivityState::Failed(reason));
    }

    pub fn poll(&self, id: &ActivityId) -> Option<&ActivityState> {
        self.activities.get(id)
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}
