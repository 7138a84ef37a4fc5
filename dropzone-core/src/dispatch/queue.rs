use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::config::DispatchConfig;

/// A ready file waiting for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub path: PathBuf,
    pub use_case: String,
    pub enqueued_at: Instant,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    /// Last time each path was accepted, for duplicate suppression.
    recent: HashMap<PathBuf, Instant>,
}

impl QueueState {
    fn prune(&mut self, now: Instant, window: Duration) {
        self.recent
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);
    }
}

/// FIFO of ready files with best-effort duplicate suppression.
///
/// A path is ignored while it is already queued, and when it was accepted
/// less than the duplicate window ago.
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    available: Notify,
    duplicate_window: Duration,
}

impl fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("DispatchQueue");
        debug.field("duplicate_window", &self.duplicate_window);
        match self.state.try_lock() {
            Some(state) => debug.field("queued", &state.items.len()),
            None => debug.field("queued", &"<locked>"),
        };
        debug.finish()
    }
}

impl DispatchQueue {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            duplicate_window: config.duplicate_window(),
        }
    }

    /// Queue `path`. Returns `false` when it was suppressed as a duplicate.
    pub fn enqueue(&self, path: impl Into<PathBuf>, use_case: &str) -> bool {
        let path = path.into();
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            state.prune(now, self.duplicate_window);

            if state.recent.contains_key(&path) || state.items.iter().any(|item| item.path == path) {
                debug!(path = %path.display(), "suppressed duplicate enqueue");
                return false;
            }

            state.recent.insert(path.clone(), now);
            state.items.push_back(QueueItem {
                path,
                use_case: use_case.to_string(),
                enqueued_at: now,
            });
        }
        self.available.notify_one();
        true
    }

    pub fn try_dequeue(&self) -> Option<QueueItem> {
        self.state.lock().items.pop_front()
    }

    /// Wait until an item may be available, at most `idle_wait`.
    pub async fn wait_available(&self, idle_wait: Duration) {
        let _ = tokio::time::timeout(idle_wait, self.available.notified()).await;
    }

    /// Claim a path that an in-flight item resolved to under a new name.
    ///
    /// Returns `false` if that name was already accepted within the window,
    /// meaning it has been (or is being) dispatched on its own. A queued
    /// entry for the name is dropped so it is not dispatched twice.
    pub fn claim(&self, path: &Path) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.prune(now, self.duplicate_window);

        let queued = state.items.iter().position(|item| item.path == path);
        if let Some(index) = queued {
            state.items.remove(index);
        } else if state.recent.contains_key(path) {
            return false;
        }
        state.recent.insert(path.to_path_buf(), now);
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Drop every queued item. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.items.len();
        state.items.clear();
        state.recent.clear();
        dropped
    }
}
