//! Pipeline orchestration.
//!
//! Every configured use case becomes a *stage*: a [`DirectoryWatcher`] feeding
//! a [`StabilityMonitor`], whose stable paths pass through a
//! [`ReadinessGate`] before the stage's action runs. Upload stages hand their
//! files to a [`DispatchQueue`] drained by one [`DispatchConsumer`] each.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet, spawn_blocking};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::baseline::{BaselineCorrelator, RECORD_EXTENSION};
use crate::config::PipelineTuning;
use crate::dispatch::{ConsumerContext, DispatchConsumer, DispatchQueue, DispatchReport};
use crate::error::{DropzoneError, Result};
use crate::plugin::ProcessorResolver;
use crate::readiness::{Readiness, ReadinessGate};
use crate::retention::spawn_sweeper;
use crate::router::{Rule, RuleRouter};
use crate::watch::{ChangeKind, DirectoryWatcher, FsProbe, RawEvent, StabilityMonitor, WatchTarget};

/// Copy files matching ordered rules out of the watched folders.
#[derive(Debug, Clone, Default)]
pub struct ClassificationSettings {
    pub targets: Vec<WatchTarget>,
    pub rules: Vec<Rule>,
}

/// Record timestamps from source files and tag pending comparison files.
#[derive(Debug, Clone, Default)]
pub struct BaselineSettings {
    pub sources: Vec<WatchTarget>,
    /// Records are stored under `<base_folder>/Baseline`.
    pub base_folder: PathBuf,
    pub comparison_folders: Vec<PathBuf>,
}

/// Dispatch files from the watched folders to a named plugin.
#[derive(Debug, Clone, Default)]
pub struct UploadSettings {
    pub name: String,
    pub targets: Vec<WatchTarget>,
    pub plugin: String,
    pub config_path: Option<PathBuf>,
    /// Wait for a baseline record (and rename) before dispatch.
    pub correlate: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    pub classification: Option<ClassificationSettings>,
    pub baseline: Option<BaselineSettings>,
    pub uploads: Vec<UploadSettings>,
    pub tuning: PipelineTuning,
}

/// Owns every pipeline and its start/stop lifecycle.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    resolver: Arc<dyn ProcessorResolver>,
    reports: Option<mpsc::UnboundedSender<DispatchReport>>,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let running = match self.running.try_lock() {
            Ok(guard) => format!("{}", guard.is_some()),
            Err(_) => "<locked>".to_string(),
        };
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .field("running", &running)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(settings: OrchestratorSettings, resolver: Arc<dyn ProcessorResolver>) -> Self {
        Self {
            settings,
            resolver,
            reports: None,
            running: Mutex::new(None),
        }
    }

    /// Receive one [`DispatchReport`] per dispatched item.
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<DispatchReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Start every configured pipeline. Configuration errors (bad patterns,
    /// correlation without a baseline) abort the start and leave nothing
    /// running. Calling `start` while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut guard = self.running.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut running = Running::new(self.settings.tuning.dispatch.shutdown_timeout());
        if let Err(err) = self.launch(&mut running).await {
            error!(error = %err, "failed to start pipelines");
            running.shutdown().await;
            return Err(err);
        }

        info!(
            stages = running.watchers.len(),
            consumers = running.consumers.len(),
            "pipelines started"
        );
        *guard = Some(running);
        Ok(())
    }

    /// Stop every pipeline: watchers are dropped, tracked files forgotten,
    /// and each consumer exits after its in-flight item.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.shutdown().await;
            info!("pipelines stopped");
        }
    }

    async fn launch(&self, running: &mut Running) -> Result<()> {
        let tuning = &self.settings.tuning;
        let cancel = running.cancel.clone();

        if let Some(classification) = &self.settings.classification {
            let router = RuleRouter::new(&classification.rules)?;
            if router.is_empty() {
                warn!("classification has no rules; files will only be logged");
            }
            let action = StageAction::Classify(Arc::new(router));
            self.launch_stage("classification", classification.targets.clone(), action, running)
                .await?;
        }

        let correlator = match &self.settings.baseline {
            Some(baseline) => Some(self.launch_baseline(baseline, running).await?),
            None => None,
        };

        for upload in &self.settings.uploads {
            let correlator = match (&correlator, upload.correlate) {
                (Some(correlator), true) => Some(Arc::clone(correlator)),
                (None, true) => {
                    return Err(DropzoneError::Config(format!(
                        "upload `{}` correlates with baselines but no baseline is configured",
                        upload.name
                    )));
                }
                (_, false) => None,
            };

            let queue = Arc::new(DispatchQueue::new(&tuning.dispatch));
            let action = StageAction::Upload {
                queue: Arc::clone(&queue),
                use_case: upload.name.clone(),
            };
            self.launch_stage(&upload.name, upload.targets.clone(), action, running)
                .await?;

            let context = ConsumerContext {
                use_case: upload.name.clone(),
                plugin: upload.plugin.clone(),
                config_path: upload.config_path.clone(),
                correlator,
                resolver: Arc::clone(&self.resolver),
                reports: self.reports.clone(),
            };
            let consumer = DispatchConsumer::new(queue, context, &tuning.dispatch);
            running.consumers.push(consumer.spawn(cancel.clone()));
        }

        Ok(())
    }

    async fn launch_baseline(
        &self,
        baseline: &BaselineSettings,
        running: &mut Running,
    ) -> Result<Arc<BaselineCorrelator>> {
        let tuning = &self.settings.tuning;
        let correlator = Arc::new(
            BaselineCorrelator::new(
                &baseline.base_folder,
                baseline.comparison_folders.clone(),
                tuning.baseline,
            )
            .with_cancellation(running.cancel.clone()),
        );
        correlator.ensure_store()?;

        self.launch_stage(
            "baseline-source",
            baseline.sources.clone(),
            StageAction::RecordSource(Arc::clone(&correlator)),
            running,
        )
        .await?;

        let store = WatchTarget::new(correlator.baseline_dir())
            .with_filter(format!("*.{RECORD_EXTENSION}"));
        self.launch_stage(
            "baseline-records",
            vec![store],
            StageAction::RecordStore(Arc::clone(&correlator)),
            running,
        )
        .await?;

        // Records written while the agent was down.
        let reconcile = Arc::clone(&correlator);
        running.tasks.push(tokio::spawn(async move {
            reconcile.reconcile_all().await;
        }));

        if tuning.retention.enabled {
            running.tasks.push(spawn_sweeper(
                correlator.baseline_dir().to_path_buf(),
                tuning.retention,
                running.cancel.clone(),
            ));
        }

        Ok(correlator)
    }

    async fn launch_stage(
        &self,
        name: &str,
        targets: Vec<WatchTarget>,
        action: StageAction,
        running: &mut Running,
    ) -> Result<()> {
        let tuning = &self.settings.tuning;
        let capacity = tuning.watch.channel_capacity.max(16);

        let watcher = Arc::new(DirectoryWatcher::new(targets, &tuning.watch)?);
        let (raw_tx, raw_rx) = mpsc::channel(capacity);
        let (stable_tx, stable_rx) = mpsc::channel(capacity);
        let monitor = StabilityMonitor::new(tuning.stability, Arc::new(FsProbe), stable_tx);

        let watched = watcher.start(raw_tx).await?;
        info!(stage = name, watched, "stage watching");

        let stage = Arc::new(Stage {
            name: name.to_string(),
            gate: ReadinessGate::new(tuning.readiness).with_cancellation(running.cancel.clone()),
            action,
        });

        running.tasks.push(tokio::spawn(run_event_loop(
            raw_rx,
            Arc::clone(&watcher),
            monitor.clone(),
            running.cancel.clone(),
        )));
        running
            .tasks
            .push(tokio::spawn(run_ready_loop(stage, stable_rx, running.cancel.clone())));
        running.watchers.push(watcher);
        running.monitors.push(monitor);
        Ok(())
    }
}

struct Running {
    cancel: CancellationToken,
    consumer_timeout: Duration,
    watchers: Vec<Arc<DirectoryWatcher>>,
    monitors: Vec<StabilityMonitor>,
    tasks: Vec<JoinHandle<()>>,
    consumers: Vec<JoinHandle<()>>,
}

impl Running {
    fn new(consumer_timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            consumer_timeout,
            watchers: Vec::new(),
            monitors: Vec::new(),
            tasks: Vec::new(),
            consumers: Vec::new(),
        }
    }

    async fn shutdown(self) {
        self.cancel.cancel();

        for watcher in &self.watchers {
            watcher.stop();
        }
        for monitor in &self.monitors {
            monitor.clear();
        }
        for task in &self.tasks {
            task.abort();
        }

        for mut handle in self.consumers {
            match tokio::time::timeout(self.consumer_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "dispatch consumer failed"),
                Err(_) => {
                    // Drops the consumer and its report sender. A plugin call
                    // already on a blocking thread runs to completion detached.
                    handle.abort();
                    warn!(
                        timeout_ms = self.consumer_timeout.as_millis() as u64,
                        "dispatch consumer did not finish its in-flight item; abandoned"
                    );
                }
            }
        }
    }
}

enum StageAction {
    Classify(Arc<RuleRouter>),
    /// Extract a timestamp and write a baseline record.
    RecordSource(Arc<BaselineCorrelator>),
    /// A record appeared: tag the matching comparison files.
    RecordStore(Arc<BaselineCorrelator>),
    Upload {
        queue: Arc<DispatchQueue>,
        use_case: String,
    },
}

struct Stage {
    name: String,
    gate: ReadinessGate,
    action: StageAction,
}

impl Stage {
    async fn handle(&self, path: PathBuf) {
        match &self.action {
            // The correlator gates its own reads.
            StageAction::RecordSource(correlator) => {
                correlator.create_record(&path).await;
            }
            StageAction::RecordStore(correlator) => {
                correlator.apply_record_file(&path).await;
            }
            StageAction::Classify(router) => {
                if !self.ready(&path).await {
                    return;
                }
                let router = Arc::clone(router);
                if let Err(err) = spawn_blocking(move || router.apply(&path)).await {
                    error!(stage = %self.name, error = %err, "routing task failed");
                }
            }
            StageAction::Upload { queue, use_case } => {
                if !self.ready(&path).await {
                    return;
                }
                if queue.enqueue(&path, use_case) {
                    debug!(stage = %self.name, path = %path.display(), "queued for dispatch");
                }
            }
        }
    }

    async fn ready(&self, path: &Path) -> bool {
        match self.gate.wait_ready(path).await {
            Readiness::Ready { .. } => true,
            Readiness::Locked { attempts } => {
                warn!(stage = %self.name, path = %path.display(), attempts, "file still locked; abandoning for this cycle");
                false
            }
            Readiness::Missing => {
                debug!(stage = %self.name, path = %path.display(), "file vanished before it was ready");
                false
            }
            Readiness::Cancelled => false,
        }
    }
}

async fn run_event_loop(
    mut raw_rx: mpsc::Receiver<RawEvent>,
    watcher: Arc<DirectoryWatcher>,
    monitor: StabilityMonitor,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = raw_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event.kind {
            ChangeKind::Created | ChangeKind::Changed => monitor.observe(&event.path),
            ChangeKind::Renamed => {
                if let Some(old) = &event.old_path {
                    monitor.forget(old);
                }
                monitor.observe(&event.path);
            }
            ChangeKind::Deleted => monitor.forget(&event.path),
            ChangeKind::Overflow => {
                let files = watcher.rescan(&event.path);
                warn!(folder = %event.path.display(), files = files.len(), "watch overflow; rescanned folder");
                for file in files {
                    monitor.observe(&file);
                }
            }
        }
    }
}

/// Each stable file gets its own task so one slow readiness wait never holds
/// up the rest of the stage.
async fn run_ready_loop(
    stage: Arc<Stage>,
    mut stable_rx: mpsc::Receiver<PathBuf>,
    cancel: CancellationToken,
) {
    let mut inflight = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(err) = joined {
                    error!(stage = %stage.name, error = %err, "file task failed");
                }
            }
            path = stable_rx.recv() => {
                let Some(path) = path else { break };
                debug!(stage = %stage.name, path = %path.display(), "file is stable");
                let stage = Arc::clone(&stage);
                inflight.spawn(async move { stage.handle(path).await });
            }
        }
    }
    inflight.shutdown().await;
}
