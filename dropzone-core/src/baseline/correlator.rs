use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::extract::extract_timestamp;
use super::record::{BASELINE_DIR, BaselineRecord, CorrelationKey, PLACEHOLDER};
use crate::config::BaselineTiming;
use crate::error::Result;
use crate::readiness::{Readiness, ReadinessGate};

/// Result of applying a correlation tag to one target file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenameOutcome {
    Renamed { from: PathBuf, to: PathBuf },
    /// The name has no placeholder left.
    AlreadyCorrected(PathBuf),
    /// The file disappeared before it could be renamed.
    Vanished(PathBuf),
    /// The file's writer never released it.
    Locked(PathBuf),
    Failed { path: PathBuf, error: String },
}

/// Records baseline timestamps and renames pending targets to match them.
#[derive(Debug, Clone)]
pub struct BaselineCorrelator {
    baseline_dir: PathBuf,
    comparison_folders: Vec<PathBuf>,
    timing: BaselineTiming,
    source_gate: ReadinessGate,
    target_gate: ReadinessGate,
    cancel: CancellationToken,
}

impl BaselineCorrelator {
    /// Records live in `<base_folder>/Baseline`.
    pub fn new(
        base_folder: impl AsRef<Path>,
        comparison_folders: Vec<PathBuf>,
        timing: BaselineTiming,
    ) -> Self {
        Self {
            baseline_dir: base_folder.as_ref().join(BASELINE_DIR),
            comparison_folders,
            source_gate: ReadinessGate::new(timing.source_readiness),
            target_gate: ReadinessGate::new(timing.target_readiness),
            timing,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort readiness waits and baseline lookups when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.source_gate = self.source_gate.with_cancellation(cancel.clone());
        self.target_gate = self.target_gate.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn baseline_dir(&self) -> &Path {
        &self.baseline_dir
    }

    pub fn comparison_folders(&self) -> &[PathBuf] {
        &self.comparison_folders
    }

    pub fn ensure_store(&self) -> Result<()> {
        fs::create_dir_all(&self.baseline_dir)?;
        Ok(())
    }

    /// Every parseable record in the store, oldest first.
    pub fn records(&self) -> Vec<BaselineRecord> {
        let Ok(entries) = fs::read_dir(&self.baseline_dir) else {
            return Vec::new();
        };
        let mut records: Vec<_> = entries
            .flatten()
            .filter_map(|entry| BaselineRecord::parse(&entry.file_name().to_string_lossy()))
            .collect();
        records.sort();
        records
    }

    /// Extract a timestamp from `source` and write its record. Returns the
    /// record path; `None` when the source is locked, unreadable or carries
    /// no timestamp.
    pub async fn create_record(&self, source: &Path) -> Option<PathBuf> {
        let readiness = self.source_gate.wait_ready(source).await;
        if !readiness.is_ready() {
            debug!(source = %source.display(), ?readiness, "baseline source not ready; skipping");
            return None;
        }

        let bytes = match fs::read(source) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(source = %source.display(), error = %err, "failed to read baseline source");
                return None;
            }
        };
        let Some(timestamp) = extract_timestamp(&String::from_utf8_lossy(&bytes)) else {
            debug!(source = %source.display(), "no timestamp in baseline source");
            return None;
        };
        let origin = source.file_stem()?.to_string_lossy().into_owned();
        let record = BaselineRecord::new(timestamp, origin);
        let path = self.baseline_dir.join(record.file_name());

        let written = fs::create_dir_all(&self.baseline_dir).and_then(|()| File::create(&path));
        if let Err(err) = written {
            error!(record = %path.display(), error = %err, "failed to write baseline record");
            return None;
        }

        info!(source = %source.display(), record = %record, "recorded baseline");
        Some(path)
    }

    /// Apply the record stored at `record_path` to every comparison folder.
    pub async fn apply_record_file(&self, record_path: &Path) -> Vec<RenameOutcome> {
        let Some(record) = record_path
            .file_name()
            .and_then(|name| BaselineRecord::parse(&name.to_string_lossy()))
        else {
            debug!(path = %record_path.display(), "not a baseline record");
            return Vec::new();
        };
        self.apply_record(&record).await
    }

    /// Rename every pending target matching `record`.
    pub async fn apply_record(&self, record: &BaselineRecord) -> Vec<RenameOutcome> {
        let Some(key) = record.correlation_key() else {
            debug!(record = %record, "record carries no correlation tag");
            return Vec::new();
        };

        let mut outcomes = Vec::new();
        for folder in &self.comparison_folders {
            let entries = match fs::read_dir(folder) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(folder = %folder.display(), error = %err, "cannot list comparison folder");
                    continue;
                }
            };

            let mut candidates: Vec<PathBuf> = entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| {
                    path.is_file()
                        && path
                            .file_name()
                            .is_some_and(|name| key.matches(&name.to_string_lossy()))
                })
                .collect();
            candidates.sort();

            for path in candidates {
                let outcome = self.rename_when_ready(&path, &key).await;
                if let RenameOutcome::Renamed { from, to } = &outcome {
                    info!(from = %from.display(), to = %to.display(), tag = %key.tag, "applied correlation tag");
                }
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Apply every stored record to every comparison folder. Returns how
    /// many files were renamed.
    pub async fn reconcile_all(&self) -> usize {
        let mut renamed = 0;
        for record in self.records() {
            renamed += self
                .apply_record(&record)
                .await
                .iter()
                .filter(|outcome| matches!(outcome, RenameOutcome::Renamed { .. }))
                .count();
        }
        if renamed > 0 {
            info!(renamed, "reconciled pending files against existing baseline records");
        }
        renamed
    }

    /// Wait up to the lookup timeout for a record matching `raw`, apply its tag
    /// and return the (possibly renamed) path. A record matches when `raw`'s
    /// name carries both its timestamp and its prefix token. Returns `raw`
    /// unchanged on timeout or cancellation.
    pub async fn lookup(&self, raw: &Path) -> PathBuf {
        let Some(name) = raw.file_name().map(|name| name.to_string_lossy().into_owned()) else {
            return raw.to_path_buf();
        };
        if !name.contains(PLACEHOLDER) {
            return raw.to_path_buf();
        }

        let timeout = self.timing.lookup_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(resolved) = self.try_resolve(raw, &name) {
                return resolved;
            }

            let now = Instant::now();
            if now >= deadline {
                info!(
                    file = %raw.display(),
                    timeout_ms = timeout.as_millis() as u64,
                    "no baseline record arrived; continuing with original name"
                );
                return raw.to_path_buf();
            }

            let nap = self.timing.lookup_poll().min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => return raw.to_path_buf(),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    fn try_resolve(&self, raw: &Path, name: &str) -> Option<PathBuf> {
        let key = self
            .records()
            .into_iter()
            .rev()
            .filter_map(|record| record.correlation_key())
            .find(|key| key.matches(name))?;

        let Some(corrected) = key.corrected_name(name) else {
            return Some(raw.to_path_buf());
        };
        let target = raw.with_file_name(corrected);

        match rename_with_key(raw, &key) {
            RenameOutcome::Renamed { to, .. } => {
                info!(from = %raw.display(), to = %to.display(), "correlated file before dispatch");
                Some(to)
            }
            // Someone else (the record watcher) got there first.
            RenameOutcome::Vanished(_) if target.exists() => Some(target),
            _ => Some(raw.to_path_buf()),
        }
    }

    async fn rename_when_ready(&self, path: &Path, key: &CorrelationKey) -> RenameOutcome {
        let has_placeholder = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().contains(PLACEHOLDER));
        if !has_placeholder {
            return RenameOutcome::AlreadyCorrected(path.to_path_buf());
        }

        match self.target_gate.wait_ready(path).await {
            Readiness::Ready { .. } => rename_with_key(path, key),
            Readiness::Missing => RenameOutcome::Vanished(path.to_path_buf()),
            Readiness::Locked { .. } | Readiness::Cancelled => {
                debug!(path = %path.display(), "target still locked; leaving for the next pass");
                RenameOutcome::Locked(path.to_path_buf())
            }
        }
    }
}

/// Replace the placeholder in `path`'s name with `key`'s tag, renaming in
/// place. Names without the placeholder are left untouched.
pub fn rename_with_key(path: &Path, key: &CorrelationKey) -> RenameOutcome {
    let Some(name) = path.file_name().map(|name| name.to_string_lossy().into_owned()) else {
        return RenameOutcome::AlreadyCorrected(path.to_path_buf());
    };
    let Some(corrected) = key.corrected_name(&name) else {
        return RenameOutcome::AlreadyCorrected(path.to_path_buf());
    };

    let target = path.with_file_name(corrected);
    if target.exists() {
        if !path.exists() {
            debug!(path = %path.display(), "already renamed by another pass");
            return RenameOutcome::Vanished(path.to_path_buf());
        }
        warn!(
            path = %path.display(),
            target = %target.display(),
            "corrected name already exists; leaving file in place"
        );
        return RenameOutcome::Failed {
            path: path.to_path_buf(),
            error: format!("{} already exists", target.display()),
        };
    }

    match fs::rename(path, &target) {
        Ok(()) => RenameOutcome::Renamed {
            from: path.to_path_buf(),
            to: target,
        },
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "rename raced with another writer");
            RenameOutcome::Vanished(path.to_path_buf())
        }
        Err(err) => {
            error!(path = %path.display(), target = %target.display(), error = %err, "rename failed");
            RenameOutcome::Failed {
                path: path.to_path_buf(),
                error: err.to_string(),
            }
        }
    }
}
