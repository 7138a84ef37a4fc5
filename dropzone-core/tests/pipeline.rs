//! End-to-end runs of the orchestrator against real folders, real notify
//! watchers and WebAssembly plugins.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dropzone_core::config::StabilityConfig;
use dropzone_core::{
    BaselineSettings, ClassificationSettings, DispatchReport, DispatchStatus, Orchestrator,
    OrchestratorSettings, PipelineTuning, PluginHost, PluginLoader, PluginRegistry, Rule,
    UploadSettings, WatchTarget,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

const ACCEPT: &str = r#"(module
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))
  (func (export "alloc") (param $len i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $len
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "process_and_upload") (param i32 i32 i32 i32) (result i32)
    i32.const 0))"#;

const TRAP: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "alloc") (param i32) (result i32)
    i32.const 2048)
  (func (export "process_and_upload") (param i32 i32)
    unreachable))"#;

fn fast_tuning() -> PipelineTuning {
    let mut tuning = PipelineTuning::default();
    tuning.stability = StabilityConfig {
        poll_interval_ms: 100,
        quiet_interval_ms: 300,
    };
    tuning.baseline.lookup_timeout_ms = 10_000;
    tuning.baseline.lookup_poll_ms = 100;
    tuning
}

fn mkdir(root: &Path, name: &str) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn plugin_host(root: &Path, modules: &[(&str, &str)]) -> PluginHost {
    let loader = Arc::new(PluginLoader::new());
    let registry = PluginRegistry::open(mkdir(root, "plugins"), Arc::clone(&loader)).unwrap();
    let staging = mkdir(root, "staging");
    for (name, wat) in modules {
        let path = staging.join(format!("{name}.wat"));
        fs::write(&path, wat).unwrap();
        registry.register(&path).unwrap();
    }
    PluginHost::new(Arc::new(registry), loader)
}

async fn wait_for(path: &Path, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    path.exists()
}

async fn next_report(reports: &mut mpsc::UnboundedReceiver<DispatchReport>) -> DispatchReport {
    timeout(Duration::from_secs(20), reports.recv())
        .await
        .expect("report within deadline")
        .expect("report channel open")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gradually_written_log_is_copied_once() {
    let tmp = TempDir::new().unwrap();
    let input = mkdir(tmp.path(), "in");
    let output = tmp.path().join("out");

    let settings = OrchestratorSettings {
        classification: Some(ClassificationSettings {
            targets: vec![WatchTarget::new(&input)],
            rules: vec![Rule::new(r"^LOG_\d+\.txt$", &output)],
        }),
        tuning: fast_tuning(),
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(settings, Arc::new(plugin_host(tmp.path(), &[])));
    orchestrator.start().await.unwrap();

    let source = input.join("LOG_42.txt");
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&source)
        .unwrap();
    for chunk in 0..4 {
        writeln!(file, "line {chunk}").unwrap();
        file.flush().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    drop(file);
    fs::write(input.join("notes.txt"), b"ignored").unwrap();

    let copied = output.join("LOG_42.txt");
    assert!(wait_for(&copied, Duration::from_secs(10)).await);
    tokio::time::sleep(Duration::from_millis(800)).await;
    orchestrator.stop().await;

    let entries: Vec<_> = fs::read_dir(&output).unwrap().flatten().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        fs::read_to_string(&copied).unwrap(),
        "line 0\nline 1\nline 2\nline 3\n"
    );
    assert!(source.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trapping_plugin_does_not_stop_dispatch() {
    let tmp = TempDir::new().unwrap();
    let fragile = mkdir(tmp.path(), "fragile");
    let steady = mkdir(tmp.path(), "steady");
    let host = plugin_host(tmp.path(), &[("trap", TRAP), ("accept", ACCEPT)]);

    let settings = OrchestratorSettings {
        uploads: vec![
            UploadSettings {
                name: "fragile".into(),
                targets: vec![WatchTarget::new(&fragile)],
                plugin: "trap".into(),
                ..Default::default()
            },
            UploadSettings {
                name: "steady".into(),
                targets: vec![WatchTarget::new(&steady)],
                plugin: "ACCEPT".into(),
                ..Default::default()
            },
        ],
        tuning: fast_tuning(),
        ..Default::default()
    };
    let (tx, mut reports) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(settings, Arc::new(host)).with_reports(tx);
    orchestrator.start().await.unwrap();

    fs::write(fragile.join("first.csv"), b"1").unwrap();
    fs::write(fragile.join("second.csv"), b"2").unwrap();
    fs::write(steady.join("third.csv"), b"3").unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(next_report(&mut reports).await);
    }
    orchestrator.stop().await;

    let fragile_failures = received
        .iter()
        .filter(|report| report.use_case == "fragile")
        .filter(|report| matches!(report.status, DispatchStatus::Failed { .. }))
        .count();
    assert_eq!(fragile_failures, 2);
    let steady_report = received
        .iter()
        .find(|report| report.use_case == "steady")
        .expect("steady pipeline dispatched");
    assert_eq!(steady_report.status, DispatchStatus::Success);
    assert_eq!(steady_report.dispatched, steady.join("third.csv"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_waits_for_baseline_and_dispatches_renamed_file() {
    let tmp = TempDir::new().unwrap();
    let sources = mkdir(tmp.path(), "sources");
    let uploads = mkdir(tmp.path(), "uploads");
    let host = plugin_host(tmp.path(), &[("accept", ACCEPT)]);

    let settings = OrchestratorSettings {
        baseline: Some(BaselineSettings {
            sources: vec![WatchTarget::new(&sources).with_filter("*.txt")],
            base_folder: tmp.path().join("base"),
            comparison_folders: vec![],
        }),
        uploads: vec![UploadSettings {
            name: "upload".into(),
            targets: vec![WatchTarget::new(&uploads)],
            plugin: "accept".into(),
            correlate: true,
            ..Default::default()
        }],
        tuning: fast_tuning(),
        ..Default::default()
    };
    let (tx, mut reports) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(settings, Arc::new(host)).with_reports(tx);
    orchestrator.start().await.unwrap();

    fs::write(uploads.join("WAFER01_#1_20240102_134501.csv"), b"data").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    fs::write(
        sources.join("WAFER01_C1W12_scan.txt"),
        "Tool: P7\nDate and Time: 01/02/2024 01:45:01 PM\n",
    )
    .unwrap();

    let report = next_report(&mut reports).await;
    assert_eq!(report.queued, uploads.join("WAFER01_#1_20240102_134501.csv"));
    assert_eq!(report.dispatched, uploads.join("WAFER01_C1W12_20240102_134501.csv"));
    assert_eq!(report.status, DispatchStatus::Success);
    assert!(
        tmp.path()
            .join("base/Baseline/20240102_134501_WAFER01_C1W12_scan.info")
            .exists()
    );

    // The rename is seen by the watcher but must not be dispatched again.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(reports.try_recv().is_err());
    orchestrator.stop().await;
}
