use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::trackers::TrackerError;

/// Bounded per-workflow history shared by the built-in trackers.
///
/// Oldest entries are dropped first once a workflow reaches `capacity`.
pub struct WorkflowHistory<T> {
    tracker: &'static str,
    capacity: usize,
    entries: Mutex<HashMap<String, VecDeque<T>>>,
}

impl<T: Clone> WorkflowHistory<T> {
    pub fn new(tracker: &'static str, capacity: usize) -> Self {
        Self {
            tracker,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn push(&self, workflow: &str, entry: T) -> Result<(), TrackerError> {
        let mut entries = self.lock()?;
        let history = entries.entry(workflow.to_string()).or_default();
        history.push_back(entry);
        while history.len() > self.capacity {
            history.pop_front();
        }
        Ok(())
    }

    /// Copy of the history for `workflow`, oldest first.
    pub fn get(&self, workflow: &str) -> Result<Vec<T>, TrackerError> {
        Ok(self
            .lock()?
            .get(workflow)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn latest(&self, workflow: &str) -> Result<Option<T>, TrackerError> {
        Ok(self.lock()?.get(workflow).and_then(|h| h.back().cloned()))
    }

    pub fn workflows(&self) -> Result<HashSet<String>, TrackerError> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    pub fn remove(&self, workflow: &str) -> Result<(), TrackerError> {
        self.lock()?.remove(workflow);
        Ok(())
    }

    pub fn trim_to(&self, max_len: usize) -> Result<usize, TrackerError> {
        let mut dropped = 0;
        for history in self.lock()?.values_mut() {
            while history.len() > max_len {
                history.pop_front();
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, VecDeque<T>>>, TrackerError> {
        self.entries.lock().map_err(|_| TrackerError::Poisoned {
            tracker: self.tracker.to_string(),
        })
    }
}
