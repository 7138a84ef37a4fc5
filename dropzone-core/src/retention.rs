//! Periodic deletion of old baseline records.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime, TimeDelta};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::baseline::BaselineRecord;
use crate::config::RetentionConfig;
use crate::error::Result;

/// Delete every record in `baseline_dir` whose timestamp is more than
/// `keep_days` before `now`. Files that do not parse as records are left
/// alone. Returns how many records were deleted.
pub fn sweep(baseline_dir: &Path, keep_days: u32, now: NaiveDateTime) -> Result<usize> {
    let Some(cutoff) = now.checked_sub_signed(TimeDelta::days(i64::from(keep_days))) else {
        return Ok(0);
    };
    let entries = match fs::read_dir(baseline_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(record) = BaselineRecord::parse(&name.to_string_lossy()) else {
            continue;
        };
        if record.timestamp >= cutoff {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!(record = %record, "removed expired baseline record");
                removed += 1;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                error!(record = %record, error = %err, "failed to remove expired baseline record");
            }
        }
    }
    Ok(removed)
}

/// Sweep `baseline_dir` immediately and then every `sweep_interval` until
/// `cancel` fires.
pub fn spawn_sweeper(
    baseline_dir: PathBuf,
    config: RetentionConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            dir = %baseline_dir.display(),
            keep_days = config.keep_days,
            "baseline retention enabled"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Local::now().naive_local();
            match sweep(&baseline_dir, config.keep_days, now) {
                Ok(0) => {}
                Ok(removed) => info!(removed, "cleaned up expired baseline records"),
                Err(err) => error!(error = %err, "baseline retention sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::time::Duration;

    use chrono::NaiveDate;
    use tempfile::TempDir;

    use super::*;

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn touch(dir: &Path, name: &str) {
        File::create(dir.join(name)).unwrap();
    }

    #[test]
    fn deletes_only_expired_records() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "20240301_080000_W1_C1W2_a.info");
        touch(dir.path(), "20240309_080000_W2_C1W2_b.info");
        touch(dir.path(), "notes.txt");

        let removed = sweep(dir.path(), 7, at(10)).unwrap();

        assert_eq!(removed, 1);
        assert!(!dir.path().join("20240301_080000_W1_C1W2_a.info").exists());
        assert!(dir.path().join("20240309_080000_W2_C1W2_b.info").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn missing_store_is_empty() {
        let dir = TempDir::new().unwrap();
        assert_eq!(sweep(&dir.path().join("Baseline"), 7, at(10)).unwrap(), 0);
    }

    #[tokio::test]
    async fn sweeper_runs_immediately_and_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "20000101_000000_W1_C1W2_a.info");

        let cancel = CancellationToken::new();
        let config = RetentionConfig {
            enabled: true,
            keep_days: 1,
            sweep_interval_ms: 60_000,
        };
        let handle = spawn_sweeper(dir.path().to_path_buf(), config, cancel.clone());

        let record = dir.path().join("20000101_000000_W1_C1W2_a.info");
        for _ in 0..100 {
            if !record.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!record.exists());

        cancel.cancel();
        handle.await.unwrap();
    }
}
