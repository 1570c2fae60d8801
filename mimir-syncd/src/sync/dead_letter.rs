use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use super::state::now_rfc3339;

pub const DEFAULT_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub item_id: String,
    pub name: Option<String>,
    pub failures: u32,
    pub last_error: String,
    pub last_failure: String,
}

/// Counts consecutive failures per remote item; items past the threshold wait for a manual retry.
#[derive(Debug)]
pub struct DeadLetters {
    threshold: u32,
    entries: Mutex<HashMap<String, DeadLetter>>,
}

impl DeadLetters {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_failure(&self, item_id: &str, name: Option<&str>, error: &str) -> u32 {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry(item_id.to_string())
            .or_insert_with(|| DeadLetter {
                item_id: item_id.to_string(),
                name: None,
                failures: 0,
                last_error: String::new(),
                last_failure: String::new(),
            });
        entry.failures += 1;
        entry.last_error = error.to_string();
        entry.last_failure = now_rfc3339();
        if let Some(name) = name {
            entry.name = Some(name.to_string());
        }
        entry.failures
    }

    pub fn record_success(&self, item_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item_id);
    }

    /// Items that reached the threshold, oldest id first.
    pub fn list(&self) -> Vec<DeadLetter> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut letters: Vec<_> = entries
            .values()
            .filter(|entry| entry.failures >= self.threshold)
            .cloned()
            .collect();
        letters.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        letters
    }

    pub fn is_dead(&self, item_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item_id)
            .is_some_and(|entry| entry.failures >= self.threshold)
    }
}

impl Default for DeadLetters {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}
