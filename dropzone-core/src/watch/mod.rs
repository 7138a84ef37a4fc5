//! Directory watching.
//!
//! A thin wrapper around `notify` that turns raw OS notifications for a set
//! of [`WatchTarget`]s into [`RawEvent`]s on a tokio channel. Folders that do
//! not exist when watching starts are logged and skipped; errors raised by a
//! running stream are logged and never stop the other targets.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{GlobBuilder, GlobMatcher};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, spawn_blocking};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::WatchConfig;
use crate::error::{DropzoneError, Result};

pub mod stability;

pub use stability::{FileProbe, FileSnapshot, FsProbe, StabilityMonitor, StabilityTracker};

/// A folder to watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTarget {
    pub folder: PathBuf,
    #[serde(default)]
    pub recursive: bool,
    /// Glob matched against the file name only, e.g. `*.info`.
    #[serde(default)]
    pub filter: Option<String>,
}

impl WatchTarget {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            recursive: false,
            filter: None,
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Changed,
    Deleted,
    /// `path` is the new name; `old_path` is set when the OS reports both.
    Renamed,
    /// The OS dropped events; the target folder should be rescanned.
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
    pub old_path: Option<PathBuf>,
}

impl RawEvent {
    fn new(kind: ChangeKind, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            old_path: None,
        }
    }
}

#[derive(Debug)]
struct CompiledTarget {
    target: WatchTarget,
    filter: Option<GlobMatcher>,
}

impl CompiledTarget {
    fn compile(target: WatchTarget) -> Result<Self> {
        let filter = match target.filter.as_deref().map(str::trim) {
            None | Some("") | Some("*") | Some("*.*") => None,
            Some(pattern) => {
                let glob = GlobBuilder::new(pattern)
                    .case_insensitive(true)
                    .literal_separator(true)
                    .build()
                    .map_err(|err| DropzoneError::Pattern {
                        pattern: pattern.to_string(),
                        message: err.to_string(),
                    })?;
                Some(glob.compile_matcher())
            }
        };
        Ok(Self { target, filter })
    }

    fn admits(&self, path: &Path) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };
        path.file_name()
            .is_some_and(|name| filter.is_match(Path::new(name)))
    }
}

/// Watches a fixed set of folders and forwards their events to a channel.
///
/// `start` creates one OS watcher per existing folder; `stop` drops them all
/// so a later `start` begins from a clean slate.
pub struct DirectoryWatcher {
    targets: Arc<Vec<CompiledTarget>>,
    channel_capacity: usize,
    active: Mutex<Option<ActiveWatch>>,
}

impl fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let folders: Vec<_> = self.targets.iter().map(|t| &t.target.folder).collect();
        let mut debug = f.debug_struct("DirectoryWatcher");
        debug.field("folders", &folders);
        match self.active.try_lock() {
            Some(guard) => debug.field("active", &guard.as_ref()),
            None => debug.field("active", &"<locked>"),
        };
        debug.finish()
    }
}

impl DirectoryWatcher {
    /// Compile the targets' filters. Invalid globs are rejected here.
    pub fn new(targets: Vec<WatchTarget>, config: &WatchConfig) -> Result<Self> {
        let targets = targets
            .into_iter()
            .map(CompiledTarget::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            targets: Arc::new(targets),
            channel_capacity: config.channel_capacity.max(16),
            active: Mutex::new(None),
        })
    }

    pub fn targets(&self) -> impl Iterator<Item = &WatchTarget> {
        self.targets.iter().map(|compiled| &compiled.target)
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Begin watching. Returns how many targets got an OS watcher.
    pub async fn start(&self, sink: mpsc::Sender<RawEvent>) -> Result<usize> {
        if let Some(active) = self.active.lock().as_ref() {
            return Ok(active.watchers.len());
        }

        let (tx, rx) = mpsc::channel::<WatchMessage>(self.channel_capacity);
        let init_targets = Arc::clone(&self.targets);
        let watchers = spawn_blocking(move || init_watchers(&init_targets, tx))
            .await
            .map_err(|err| {
                DropzoneError::Internal(format!("watcher initialization panicked: {err}"))
            })?;
        let watched = watchers.len();
        let forward_task = spawn_forward_loop(Arc::clone(&self.targets), rx, sink);

        let mut guard = self.active.lock();
        if let Some(active) = guard.as_ref() {
            // Lost a race with a concurrent start; ours are dropped here.
            forward_task.abort();
            return Ok(active.watchers.len());
        }
        *guard = Some(ActiveWatch {
            watchers,
            forward_task,
        });
        Ok(watched)
    }

    /// Drop every OS watcher and stop forwarding.
    pub fn stop(&self) {
        if let Some(active) = self.active.lock().take() {
            active.shutdown();
        }
    }

    /// List the files currently present under `folder` that its target admits.
    ///
    /// Used after an [`ChangeKind::Overflow`] to recover events the OS dropped.
    pub fn rescan(&self, folder: &Path) -> Vec<PathBuf> {
        let Some(compiled) = self.targets.iter().find(|c| c.target.folder == folder) else {
            return Vec::new();
        };

        let max_depth = if compiled.target.recursive { usize::MAX } else { 1 };
        let mut files: Vec<PathBuf> = WalkDir::new(&compiled.target.folder)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    debug!(folder = %folder.display(), error = %err, "rescan skipped entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && compiled.admits(entry.path()))
            .map(|entry| entry.into_path())
            .collect();
        files.sort();
        files
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ActiveWatch {
    watchers: Vec<RecommendedWatcher>,
    forward_task: JoinHandle<()>,
}

impl ActiveWatch {
    fn shutdown(self) {
        self.forward_task.abort();
        // Dropping `watchers` stops notify streams.
    }
}

impl fmt::Debug for ActiveWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveWatch")
            .field("watcher_count", &self.watchers.len())
            .field("forward_task_finished", &self.forward_task.is_finished())
            .finish()
    }
}

enum WatchMessage {
    Event { target: usize, event: Event },
    Error { target: usize, message: String },
}

impl fmt::Debug for WatchMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMessage::Event { target, event } => f
                .debug_struct("WatchMessage::Event")
                .field("target", target)
                .field("kind", &event.kind)
                .field("path_count", &event.paths.len())
                .finish(),
            WatchMessage::Error { target, message } => f
                .debug_struct("WatchMessage::Error")
                .field("target", target)
                .field("message", message)
                .finish(),
        }
    }
}

fn spawn_forward_loop(
    targets: Arc<Vec<CompiledTarget>>,
    mut rx: mpsc::Receiver<WatchMessage>,
    sink: mpsc::Sender<RawEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                WatchMessage::Event { target, event } => {
                    let Some(compiled) = targets.get(target) else {
                        continue;
                    };
                    for raw in convert_event(compiled, event) {
                        if sink.send(raw).await.is_err() {
                            debug!("raw event receiver dropped; forward loop exiting");
                            return;
                        }
                    }
                }
                WatchMessage::Error { target, message } => {
                    let folder = targets
                        .get(target)
                        .map(|compiled| compiled.target.folder.display().to_string())
                        .unwrap_or_default();
                    if Path::new(&folder).is_dir() {
                        warn!(folder = %folder, error = %message, "watch stream error");
                    } else {
                        error!(folder = %folder, error = %message, "watched folder is no longer available");
                    }
                }
            }
        }
    })
}

fn convert_event(compiled: &CompiledTarget, event: Event) -> Vec<RawEvent> {
    if event.need_rescan() {
        return vec![RawEvent::new(
            ChangeKind::Overflow,
            compiled.target.folder.clone(),
        )];
    }

    let Some(kind) = classify_event(&event.kind) else {
        return Vec::new();
    };

    match kind {
        ChangeKind::Overflow => vec![RawEvent::new(kind, compiled.target.folder.clone())],
        ChangeKind::Renamed
            if matches!(
                event.kind,
                EventKind::Modify(ModifyKind::Name(RenameMode::Both))
            ) && event.paths.len() >= 2 =>
        {
            let mut paths = event.paths.into_iter();
            let old = paths.next();
            let new = paths.next();
            match new {
                Some(new) if compiled.admits(&new) => vec![RawEvent {
                    kind,
                    path: new,
                    old_path: old,
                }],
                _ => Vec::new(),
            }
        }
        _ => event
            .paths
            .into_iter()
            .filter(|path| compiled.admits(path))
            .map(|path| RawEvent::new(kind, path))
            .collect(),
    }
}

fn classify_event(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Renamed),
        EventKind::Modify(_) | EventKind::Any => Some(ChangeKind::Changed),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        EventKind::Access(_) => None,
        EventKind::Other => Some(ChangeKind::Overflow),
    }
}

fn init_watchers(
    targets: &[CompiledTarget],
    watcher_tx: mpsc::Sender<WatchMessage>,
) -> Vec<RecommendedWatcher> {
    let mut watchers = Vec::with_capacity(targets.len());
    for (index, compiled) in targets.iter().enumerate() {
        let folder = &compiled.target.folder;
        if !folder.is_dir() {
            warn!(folder = %folder.display(), "watch folder does not exist; skipping");
            continue;
        }

        let tx_event = watcher_tx.clone();
        let path_clone = folder.clone();
        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if let Err(err) = tx_event.blocking_send(WatchMessage::Event {
                        target: index,
                        event,
                    }) {
                        warn!(
                            "watch channel send failed for {}: {}",
                            path_clone.display(),
                            err
                        );
                    }
                }
                Err(err) => {
                    let _ = tx_event.blocking_send(WatchMessage::Error {
                        target: index,
                        message: err.to_string(),
                    });
                }
            },
            NotifyConfig::default(),
        );

        let mut watcher = match watcher {
            Ok(watcher) => watcher,
            Err(err) => {
                error!(error = %DropzoneError::watch(folder, err), "failed to create watcher");
                continue;
            }
        };

        let mode = if compiled.target.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        if let Err(err) = watcher.watch(folder, mode) {
            error!(error = %DropzoneError::watch(folder, err), "failed to watch folder");
            continue;
        }

        info!(
            folder = %folder.display(),
            recursive = compiled.target.recursive,
            filter = compiled.target.filter.as_deref().unwrap_or("*"),
            "watching folder"
        );
        watchers.push(watcher);
    }
    watchers
}
