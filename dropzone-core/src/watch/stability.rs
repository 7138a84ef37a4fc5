//! Debounce and stability tracking.
//!
//! Raw events only mark a path as "in flight". A file is declared stable
//! once its size and modification time have held still for the quiet
//! interval, which is confirmed by periodic polling rather than by further
//! events.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, trace};

use crate::config::StabilityConfig;

/// Size and modification time of a file at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSnapshot {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

/// Reads the current snapshot of a path. `None` means the path is gone or
/// is not a regular file.
pub trait FileProbe: Send + Sync {
    fn snapshot(&self, path: &Path) -> Option<FileSnapshot>;
}

/// [`FileProbe`] backed by `std::fs::metadata`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl FileProbe for FsProbe {
    fn snapshot(&self, path: &Path) -> Option<FileSnapshot> {
        let metadata = fs::metadata(path).ok()?;
        if !metadata.is_file() {
            return None;
        }
        Some(FileSnapshot {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct TrackedFile {
    last_event: Instant,
    snapshot: FileSnapshot,
}

/// Synchronous core of the stability check. Time is passed in so the rules
/// can be exercised without sleeping.
#[derive(Debug)]
pub struct StabilityTracker {
    quiet_interval: Duration,
    tracked: HashMap<PathBuf, TrackedFile>,
}

impl StabilityTracker {
    pub fn new(quiet_interval: Duration) -> Self {
        Self {
            quiet_interval,
            tracked: HashMap::new(),
        }
    }

    /// Record a raw event for `path`; restarts its quiet interval.
    pub fn observe(&mut self, path: PathBuf, snapshot: FileSnapshot, now: Instant) {
        self.tracked.insert(
            path,
            TrackedFile {
                last_event: now,
                snapshot,
            },
        );
    }

    pub fn forget(&mut self, path: &Path) -> bool {
        self.tracked.remove(path).is_some()
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.tracked.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    pub fn clear(&mut self) {
        self.tracked.clear();
    }

    /// Re-examine every tracked path and return the ones that are now stable.
    /// Stable and vanished paths are removed from tracking.
    pub fn poll(&mut self, now: Instant, probe: &dyn FileProbe) -> Vec<PathBuf> {
        let quiet = self.quiet_interval;
        let mut stable = Vec::new();

        self.tracked.retain(|path, tracked| {
            let Some(current) = probe.snapshot(path) else {
                trace!(path = %path.display(), "tracked file vanished");
                return false;
            };

            if current != tracked.snapshot {
                tracked.snapshot = current;
                tracked.last_event = now;
                return true;
            }

            if now.saturating_duration_since(tracked.last_event) >= quiet {
                stable.push(path.clone());
                return false;
            }
            true
        });

        stable.sort();
        stable
    }
}

/// Drives a [`StabilityTracker`] from a tokio interval and forwards stable
/// paths to a channel.
///
/// The polling task exists only while something is tracked: it ends itself
/// once the tracker drains and is spawned again by the next `observe`.
#[derive(Clone)]
pub struct StabilityMonitor {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<MonitorState>,
    probe: Arc<dyn FileProbe>,
    poll_interval: Duration,
    sink: mpsc::Sender<PathBuf>,
}

struct MonitorState {
    tracker: StabilityTracker,
    ticker: Option<JoinHandle<()>>,
}

impl fmt::Debug for StabilityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("StabilityMonitor");
        debug.field("poll_interval", &self.shared.poll_interval);
        match self.shared.state.try_lock() {
            Some(state) => debug
                .field("tracked", &state.tracker.len())
                .field("polling", &state.ticker.is_some()),
            None => debug.field("state", &"<locked>"),
        };
        debug.finish()
    }
}

impl StabilityMonitor {
    pub fn new(
        config: StabilityConfig,
        probe: Arc<dyn FileProbe>,
        sink: mpsc::Sender<PathBuf>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MonitorState {
                    tracker: StabilityTracker::new(config.quiet_interval()),
                    ticker: None,
                }),
                probe,
                poll_interval: config.poll_interval(),
                sink,
            }),
        }
    }

    /// Track `path`, starting the polling task if it is not running.
    pub fn observe(&self, path: &Path) {
        let Some(snapshot) = self.shared.probe.snapshot(path) else {
            trace!(path = %path.display(), "ignoring event for missing or non-file path");
            return;
        };

        let mut state = self.shared.state.lock();
        state
            .tracker
            .observe(path.to_path_buf(), snapshot, Instant::now());

        let running = state
            .ticker
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if !running {
            trace!("starting stability poll");
            state.ticker = Some(tokio::spawn(run_ticker(Arc::clone(&self.shared))));
        }
    }

    pub fn forget(&self, path: &Path) {
        if self.shared.state.lock().tracker.forget(path) {
            debug!(path = %path.display(), "stopped tracking deleted file");
        }
    }

    pub fn tracked_len(&self) -> usize {
        self.shared.state.lock().tracker.len()
    }

    pub fn is_polling(&self) -> bool {
        self.shared
            .state
            .lock()
            .ticker
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop polling and drop all tracked paths.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        state.tracker.clear();
        if let Some(handle) = state.ticker.take() {
            handle.abort();
        }
    }
}

async fn run_ticker(shared: Arc<Shared>) {
    let period = shared.poll_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let (stable, idle) = {
            let mut state = shared.state.lock();
            let stable = state
                .tracker
                .poll(Instant::now(), shared.probe.as_ref());
            let idle = state.tracker.is_empty();
            if idle {
                state.ticker = None;
            }
            (stable, idle)
        };

        for path in stable {
            debug!(path = %path.display(), "file is stable");
            if shared.sink.send(path).await.is_err() {
                return;
            }
        }

        if idle {
            trace!("stability poll idle; stopping");
            break;
        }
    }
}
