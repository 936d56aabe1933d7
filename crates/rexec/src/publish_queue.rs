use std::collections::VecDeque;

use crate::envelope::Envelope;
use crate::types::RunId;

/// A broadcast waiting for its next retransmission.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Envelope,
    /// Run the message belongs to.
    pub tag: RunId,
    pub retries_remaining: u32,
}

/// Retransmission queue providing at-least-once dissemination over the
/// fire-and-forget broadcast channel.
///
/// Each [`tick`](Self::tick) sends every entry once and decrements its
/// budget; entries whose budget reaches zero are dropped without any error.
#[derive(Debug, Default)]
pub struct PublishQueue {
    entries: VecDeque<QueuedMessage>,
}

impl PublishQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, message: Envelope, tag: RunId, retries: u32) {
        if retries == 0 {
            tracing::debug!(run_id = %tag, "broadcast enqueued with no retries, dropped");
            return;
        }
        self.entries.push_back(QueuedMessage {
            message,
            tag,
            retries_remaining: retries,
        });
    }

    /// Drain the queue once, returning the messages to broadcast in queue order.
    pub fn tick(&mut self) -> Vec<Envelope> {
        let mut due = Vec::with_capacity(self.entries.len());
        for _ in 0..self.entries.len() {
            let Some(mut entry) = self.entries.pop_front() else {
                break;
            };
            entry.retries_remaining -= 1;
            due.push(entry.message.clone());
            if entry.retries_remaining > 0 {
                self.entries.push_back(entry);
            } else {
                tracing::debug!(run_id = %entry.tag, "broadcast retries exhausted");
            }
        }
        due
    }

    /// Remove every entry tagged `tag`. Returns how many were removed.
    pub fn remove(&mut self, tag: &RunId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| &e.tag != tag);
        before - self.entries.len()
    }

    /// Remaining budget of each entry tagged `tag`, in queue order.
    pub fn retries_for(&self, tag: &RunId) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|e| &e.tag == tag)
            .map(|e| e.retries_remaining)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
