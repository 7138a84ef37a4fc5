//! Dispatch queue and the consumer loop that drains it into plugins.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, spawn_blocking};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::baseline::BaselineCorrelator;
use crate::config::DispatchConfig;
use crate::plugin::{PluginError, ProcessorResolver};

mod queue;

pub use queue::{DispatchQueue, QueueItem};

/// Outcome of dispatching a single item.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    Success,
    Failed { error: String },
    /// The item resolved to a name that was already dispatched on its own.
    Duplicate,
}

impl DispatchStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchStatus::Success)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DispatchReport {
    pub use_case: String,
    /// Path as it was queued.
    pub queued: PathBuf,
    /// Path handed to the plugin, after correlation.
    pub dispatched: PathBuf,
    pub status: DispatchStatus,
}

/// Everything a consumer needs to turn a queued path into a plugin call.
#[derive(Clone)]
pub struct ConsumerContext {
    pub use_case: String,
    pub plugin: String,
    /// Passed to plugins exposing the `(path, config)` overload.
    pub config_path: Option<PathBuf>,
    /// When set, each item waits for its baseline record before dispatch.
    pub correlator: Option<Arc<BaselineCorrelator>>,
    pub resolver: Arc<dyn ProcessorResolver>,
    pub reports: Option<mpsc::UnboundedSender<DispatchReport>>,
}

impl fmt::Debug for ConsumerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerContext")
            .field("use_case", &self.use_case)
            .field("plugin", &self.plugin)
            .field("config_path", &self.config_path)
            .field("correlates", &self.correlator.is_some())
            .finish()
    }
}

/// The long-lived loop draining one pipeline's queue.
#[derive(Debug)]
pub struct DispatchConsumer {
    queue: Arc<DispatchQueue>,
    context: ConsumerContext,
    idle_wait: Duration,
}

impl DispatchConsumer {
    pub fn new(queue: Arc<DispatchQueue>, context: ConsumerContext, config: &DispatchConfig) -> Self {
        Self {
            queue,
            context,
            idle_wait: config.idle_wait(),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Dequeue and dispatch until `cancel` fires. The in-flight item is
    /// finished; anything still queued is dropped.
    pub async fn run(self, cancel: CancellationToken) {
        info!(use_case = %self.context.use_case, plugin = %self.context.plugin, "dispatch consumer started");

        while !cancel.is_cancelled() {
            let Some(item) = self.queue.try_dequeue() else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.queue.wait_available(self.idle_wait) => {}
                }
                continue;
            };

            let report = self.dispatch(item).await;
            if let Some(reports) = &self.context.reports {
                let _ = reports.send(report);
            }
        }

        let dropped = self.queue.clear();
        info!(use_case = %self.context.use_case, dropped, "dispatch consumer stopped");
    }

    /// Correlate, resolve the plugin and invoke it for one item. Failures are
    /// logged and reported, never raised.
    pub async fn dispatch(&self, item: QueueItem) -> DispatchReport {
        let ctx = &self.context;
        let dispatched = match &ctx.correlator {
            Some(correlator) => correlator.lookup(&item.path).await,
            None => item.path.clone(),
        };

        let status = if dispatched != item.path && !self.queue.claim(&dispatched) {
            debug!(
                queued = %item.path.display(),
                dispatched = %dispatched.display(),
                "renamed file was already dispatched"
            );
            DispatchStatus::Duplicate
        } else {
            self.invoke(&dispatched).await
        };

        DispatchReport {
            use_case: item.use_case,
            queued: item.path,
            dispatched,
            status,
        }
    }

    async fn invoke(&self, file: &Path) -> DispatchStatus {
        let ctx = &self.context;
        let processor = match ctx.resolver.resolve_processor(&ctx.plugin) {
            Ok(processor) => processor,
            Err(err) => {
                error!(use_case = %ctx.use_case, plugin = %ctx.plugin, error = %err, "cannot resolve plugin");
                return DispatchStatus::Failed {
                    error: err.to_string(),
                };
            }
        };

        let task_file = file.to_path_buf();
        let config = ctx.config_path.clone();
        let outcome = spawn_blocking(move || processor.process(&task_file, config.as_deref()))
            .await
            .unwrap_or_else(|join_err| Err(PluginError::Aborted(join_err.to_string())));

        match outcome {
            Ok(()) => {
                info!(use_case = %ctx.use_case, plugin = %ctx.plugin, file = %file.display(), "dispatched file");
                DispatchStatus::Success
            }
            Err(err) => {
                error!(
                    use_case = %ctx.use_case,
                    plugin = %ctx.plugin,
                    file = %file.display(),
                    error = %err,
                    "plugin failed to process file"
                );
                DispatchStatus::Failed {
                    error: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::plugin::FileProcessor;

    /// Fails for files whose name contains "bad"; panics for "boom".
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<PathBuf>>,
    }

    impl FileProcessor for Recorder {
        fn process(&self, file: &Path, _config: Option<&Path>) -> Result<(), PluginError> {
            self.seen.lock().push(file.to_path_buf());
            let name = file.to_string_lossy();
            if name.contains("boom") {
                panic!("plugin blew up");
            }
            if name.contains("bad") {
                return Err(PluginError::Trap {
                    file: file.to_path_buf(),
                    message: "unreachable".into(),
                });
            }
            Ok(())
        }
    }

    struct StaticResolver(Arc<Recorder>);

    impl ProcessorResolver for StaticResolver {
        fn resolve_processor(&self, name: &str) -> Result<Arc<dyn FileProcessor>, PluginError> {
            if name == "recorder" {
                Ok(Arc::clone(&self.0) as Arc<dyn FileProcessor>)
            } else {
                Err(PluginError::Unresolved(name.to_string()))
            }
        }
    }

    fn consumer(
        plugin: &str,
    ) -> (
        DispatchConsumer,
        Arc<DispatchQueue>,
        Arc<Recorder>,
        mpsc::UnboundedReceiver<DispatchReport>,
    ) {
        let queue = Arc::new(DispatchQueue::new(&DispatchConfig::default()));
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let context = ConsumerContext {
            use_case: "upload".into(),
            plugin: plugin.into(),
            config_path: None,
            correlator: None,
            resolver: Arc::new(StaticResolver(Arc::clone(&recorder))),
            reports: Some(tx),
        };
        let consumer = DispatchConsumer::new(Arc::clone(&queue), context, &DispatchConfig::default());
        (consumer, queue, recorder, rx)
    }

    #[tokio::test]
    async fn failing_items_do_not_stop_the_loop() {
        let (consumer, queue, recorder, mut reports) = consumer("recorder");
        queue.enqueue("/up/bad.csv", "upload");
        queue.enqueue("/up/boom.csv", "upload");
        queue.enqueue("/up/good.csv", "upload");

        let cancel = CancellationToken::new();
        let handle = consumer.spawn(cancel.clone());

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let report = reports.recv().await.unwrap();
            statuses.push((report.queued, report.status.is_success()));
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(
            statuses,
            vec![
                (PathBuf::from("/up/bad.csv"), false),
                (PathBuf::from("/up/boom.csv"), false),
                (PathBuf::from("/up/good.csv"), true),
            ]
        );
        assert_eq!(recorder.seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn unknown_plugin_is_reported_per_item() {
        let (consumer, queue, recorder, _reports) = consumer("missing");
        queue.enqueue("/up/a.csv", "upload");
        let item = queue.try_dequeue().unwrap();

        let report = consumer.dispatch(item).await;
        assert!(matches!(report.status, DispatchStatus::Failed { ref error } if error.contains("missing")));
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drops_queued_items() {
        let (consumer, queue, _recorder, _reports) = consumer("recorder");
        let cancel = CancellationToken::new();
        cancel.cancel();
        queue.enqueue("/up/a.csv", "upload");

        consumer.run(cancel).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_consumer_picks_up_late_items() {
        let (consumer, queue, _recorder, mut reports) = consumer("recorder");
        let cancel = CancellationToken::new();
        let handle = consumer.spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(3)).await;
        queue.enqueue("/up/late.csv", "upload");

        let report = reports.recv().await.unwrap();
        assert_eq!(report.status, DispatchStatus::Success);
        cancel.cancel();
        handle.await.unwrap();
    }
}
