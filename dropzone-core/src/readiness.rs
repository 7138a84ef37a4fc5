//! Readiness gate.
//!
//! A file can hold still by size and mtime while its writer still has it
//! open. The gate opens the file for shared read and takes a shared advisory
//! lock; a conflict means the writer is not done yet, so it waits and tries
//! again up to a bounded number of attempts.
//!
//! On Windows the open itself denies writers, so any open writer blocks
//! readiness. On Unix the lock is advisory (`flock`): only writers that take
//! a lock are detected, and a writer that never locks looks ready. Such
//! writers are caught upstream by the stability tracker, which waits for
//! size and mtime to stay unchanged for the quiet interval.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;

use fs2::FileExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::ReadinessConfig;

/// Outcome of a readiness wait. Never an error: callers log and move on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { attempts: u32 },
    /// Still locked after every attempt.
    Locked { attempts: u32 },
    /// The path no longer exists.
    Missing,
    Cancelled,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

enum Probe {
    Ready,
    Locked,
    Missing,
}

#[derive(Debug, Clone)]
pub struct ReadinessGate {
    policy: ReadinessConfig,
    cancel: CancellationToken,
}

impl ReadinessGate {
    pub fn new(policy: ReadinessConfig) -> Self {
        Self {
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort pending waits when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn policy(&self) -> ReadinessConfig {
        self.policy
    }

    /// Try up to `max_attempts` times, `delay` apart.
    pub async fn wait_ready(&self, path: &Path) -> Readiness {
        let max_attempts = self.policy.max_attempts.max(1);
        let delay = self.policy.delay();

        for attempt in 1..=max_attempts {
            match probe(path) {
                Probe::Ready => {
                    trace!(path = %path.display(), attempt, "file ready");
                    return Readiness::Ready { attempts: attempt };
                }
                Probe::Missing => return Readiness::Missing,
                Probe::Locked => {
                    debug!(path = %path.display(), attempt, max_attempts, "file still locked");
                }
            }

            if attempt == max_attempts {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Readiness::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Readiness::Locked {
            attempts: max_attempts,
        }
    }
}

fn probe(path: &Path) -> Probe {
    let file = match open_shared(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Probe::Missing,
        Err(err) => {
            trace!(path = %path.display(), error = %err, "open for shared read failed");
            return Probe::Locked;
        }
    };

    match FileExt::try_lock_shared(&file) {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Probe::Ready
        }
        Err(err) => {
            trace!(path = %path.display(), error = %err, "shared lock refused");
            Probe::Locked
        }
    }
}

#[cfg(windows)]
fn open_shared(path: &Path) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;

    // Deny writers: opening fails with a sharing violation while one is active.
    const FILE_SHARE_READ: u32 = 0x0000_0001;
    OpenOptions::new()
        .read(true)
        .share_mode(FILE_SHARE_READ)
        .open(path)
}

#[cfg(not(windows))]
fn open_shared(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).open(path)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;
    use tokio::time::Instant;

    use super::*;

    fn policy(max_attempts: u32, delay_ms: u64) -> ReadinessConfig {
        ReadinessConfig {
            max_attempts,
            delay_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unlocked_file_is_ready_first_try() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("LOG_1.txt");
        std::fs::write(&path, b"done").unwrap();

        let gate = ReadinessGate::new(policy(10, 500));
        assert_eq!(gate.wait_ready(&path).await, Readiness::Ready { attempts: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn missing_file_is_reported_without_retrying() {
        let tmp = tempdir().unwrap();
        let gate = ReadinessGate::new(policy(10, 500));
        let started = Instant::now();

        assert_eq!(
            gate.wait_ready(&tmp.path().join("gone.txt")).await,
            Readiness::Missing
        );
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn held_lock_exhausts_exactly_max_attempts() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("busy.txt");
        std::fs::write(&path, b"writing").unwrap();

        let writer = File::open(&path).unwrap();
        FileExt::lock_exclusive(&writer).unwrap();

        let gate = ReadinessGate::new(policy(4, 500));
        let started = Instant::now();
        let outcome = gate.wait_ready(&path).await;

        assert_eq!(outcome, Readiness::Locked { attempts: 4 });
        // Three gaps between four attempts.
        assert_eq!(started.elapsed(), Duration::from_millis(1_500));

        FileExt::unlock(&writer).unwrap();
        assert!(gate.wait_ready(&path).await.is_ready());
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("busy.txt");
        std::fs::write(&path, b"writing").unwrap();
        let writer = File::open(&path).unwrap();
        FileExt::lock_exclusive(&writer).unwrap();

        let cancel = CancellationToken::new();
        let gate = ReadinessGate::new(policy(100, 1_000)).with_cancellation(cancel.clone());
        let waiter = tokio::spawn({
            let path = path.clone();
            async move { gate.wait_ready(&path).await }
        });

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Readiness::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn unlocked_open_writer_is_not_detected_on_unix() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("streaming.txt");
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();

        let gate = ReadinessGate::new(policy(3, 500));
        assert_eq!(gate.wait_ready(&path).await, Readiness::Ready { attempts: 1 });
        drop(writer);
    }
}
