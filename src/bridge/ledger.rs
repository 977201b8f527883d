//! Outstanding request ids.
//!
//! Every task `request_id` and every `ask_human` `question_id` the backend
//! sends is recorded here. A response may only be sent for an outstanding
//! id, and sending it retires the id.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub(crate) struct RequestLedger {
    outstanding: Mutex<HashSet<String>>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an id. Returns `false` if it was already outstanding.
    pub fn register(&self, id: &str) -> bool {
        match self.outstanding.lock() {
            Ok(mut set) => set.insert(id.to_string()),
            Err(_) => false,
        }
    }

    /// Retire an id. Returns `false` if it was not outstanding.
    pub fn retire(&self, id: &str) -> bool {
        match self.outstanding.lock() {
            Ok(mut set) => set.remove(id),
            Err(_) => false,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().map(|s| s.len()).unwrap_or(0)
    }
}
