//! Completion deduplication.
//!
//! The worker may emit more than one terminal `COMPLETED` frame for the same
//! job. A key stays tracked for a short window after its first completion so
//! repeats inside the window are suppressed, while a job legitimately rerun
//! later under the same key is reported again.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Default time a completed key stays tracked.
pub const DEFAULT_COMPLETION_WINDOW: Duration = Duration::from_secs(5);

/// Job keys that already produced a completion.
#[derive(Debug)]
pub struct CompletionTracker {
    window: Duration,
    completed: HashMap<String, Instant>,
}

impl CompletionTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            completed: HashMap::new(),
        }
    }

    /// Record a completion. Returns `true` if this is the first one inside
    /// the window, i.e. it should be broadcast.
    pub fn mark_completed(&mut self, job_key: &str, now: Instant) -> bool {
        if self.contains(job_key, now) {
            return false;
        }
        self.completed.insert(job_key.to_string(), now);
        true
    }

    pub fn contains(&self, job_key: &str, now: Instant) -> bool {
        self.completed
            .get(job_key)
            .is_some_and(|at| now.duration_since(*at) < self.window)
    }

    /// Forget a key immediately (stop/failure).
    pub fn remove(&mut self, job_key: &str) -> bool {
        self.completed.remove(job_key).is_some()
    }

    /// Drop keys whose window has passed. Returns how many were dropped.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.completed.len();
        let window = self.window;
        self.completed
            .retain(|_, at| now.duration_since(*at) < window);
        before - self.completed.len()
    }

    pub fn clear(&mut self) {
        self.completed.clear();
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_COMPLETION_WINDOW)
    }
}
