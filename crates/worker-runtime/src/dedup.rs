//! # Redelivery Dedup Window
//!
//! Time-bounded record of completed correlation IDs and the replies they
//! produced. When a redelivered item's ID is found here, the worker
//! re-publishes the stored reply instead of running the handler again.
//!
//! - Entries are valid for `window` after completion
//! - Garbage collection runs at most once per `window / 4`
//! - Size is capped at [`DedupWindow::MAX_ENTRIES`]; when full, new
//!   completions are not recorded

use parking_lot::Mutex;
use shared_types::{CorrelationId, ReplyEnvelope};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

struct Completed {
    at: Instant,
    reply: ReplyEnvelope,
}

struct DedupState {
    completed: HashMap<CorrelationId, Completed>,
    last_gc: Instant,
}

/// Completed-work cache keyed by correlation ID.
pub struct DedupWindow {
    state: Mutex<DedupState>,
    window: Duration,
    gc_interval: Duration,
}

impl DedupWindow {
    /// Maximum remembered completions.
    pub const MAX_ENTRIES: usize = 100_000;

    pub fn new(window: Duration) -> Self {
        Self {
            state: Mutex::new(DedupState {
                completed: HashMap::new(),
                last_gc: Instant::now(),
            }),
            window,
            gc_interval: window / 4,
        }
    }

    /// Remember the reply produced for `correlation_id`.
    pub fn record(&self, correlation_id: CorrelationId, reply: ReplyEnvelope) {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.maybe_gc(&mut state, now);

        if state.completed.len() >= Self::MAX_ENTRIES {
            self.garbage_collect(&mut state, now);
            if state.completed.len() >= Self::MAX_ENTRIES {
                warn!(
                    correlation_id = %correlation_id,
                    "Dedup window full, completion not recorded"
                );
                return;
            }
        }

        state
            .completed
            .insert(correlation_id, Completed { at: now, reply });
    }

    /// The stored reply, if `correlation_id` completed within the window.
    pub fn lookup(&self, correlation_id: &CorrelationId) -> Option<ReplyEnvelope> {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .completed
            .get(correlation_id)
            .filter(|entry| now.duration_since(entry.at) < self.window)
            .map(|entry| entry.reply.clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn maybe_gc(&self, state: &mut DedupState, now: Instant) {
        if now.duration_since(state.last_gc) > self.gc_interval {
            self.garbage_collect(state, now);
        }
    }

    fn garbage_collect(&self, state: &mut DedupState, now: Instant) {
        let before = state.completed.len();
        state
            .completed
            .retain(|_, entry| now.duration_since(entry.at) < self.window);
        state.last_gc = now;

        let removed = before - state.completed.len();
        if removed > 0 {
            debug!(removed, remaining = state.completed.len(), "Dedup window collected");
        }
    }
}
