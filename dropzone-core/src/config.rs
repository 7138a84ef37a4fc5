use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs that tune pipeline timing.
///
/// All fields carry defaults so a configuration file only needs to mention
/// the values it wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineTuning {
    /// Raw event channel sizing.
    pub watch: WatchConfig,
    /// Quiet-interval detection for files still being written.
    pub stability: StabilityConfig,
    /// Retry policy for files still locked by their writer.
    pub readiness: ReadinessConfig,
    /// Baseline lookup timing.
    pub baseline: BaselineTiming,
    /// Dispatch queue behaviour.
    pub dispatch: DispatchConfig,
    /// Optional cleanup of old baseline records.
    pub retention: RetentionConfig,
}

/// Tuning controls for raw filesystem notifications.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Capacity of the channel between notify callbacks and the pipeline.
    pub channel_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// How often tracked files are re-examined (ms).
    pub poll_interval_ms: u64,
    /// Size and mtime must hold still this long before a file is stable (ms).
    pub quiet_interval_ms: u64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            quiet_interval_ms: 2_000,
        }
    }
}

impl StabilityConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn quiet_interval(&self) -> Duration {
        Duration::from_millis(self.quiet_interval_ms)
    }
}

/// Bounded retry policy for the readiness gate.
///
/// The defaults (10 attempts, 500 ms apart) cap a single wait at roughly
/// five seconds. Call sites that expect long-held locks raise the attempts.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReadinessConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay_ms: 500,
        }
    }
}

impl ReadinessConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineTiming {
    /// Upper bound on how long a dispatch waits for its baseline record (ms).
    pub lookup_timeout_ms: u64,
    /// Cadence at which the baseline directory is re-listed while waiting (ms).
    pub lookup_poll_ms: u64,
    /// Readiness policy applied to source files before extracting timestamps.
    pub source_readiness: ReadinessConfig,
    /// Readiness policy applied to comparison files before renaming.
    pub target_readiness: ReadinessConfig,
}

impl Default for BaselineTiming {
    fn default() -> Self {
        Self {
            lookup_timeout_ms: 180_000,
            lookup_poll_ms: 300,
            source_readiness: ReadinessConfig::default(),
            target_readiness: ReadinessConfig {
                max_attempts: 5,
                delay_ms: 200,
            },
        }
    }
}

impl BaselineTiming {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn lookup_poll(&self) -> Duration {
        Duration::from_millis(self.lookup_poll_ms.max(1))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound on how long the consumer idles before re-checking (ms).
    pub idle_wait_ms: u64,
    /// A path re-enqueued within this window is treated as a duplicate (ms).
    pub duplicate_window_ms: u64,
    /// How long `stop` waits for a consumer's in-flight item before the
    /// consumer is abandoned (ms).
    pub shutdown_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            idle_wait_ms: 250,
            duplicate_window_ms: 5_000,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl DispatchConfig {
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_millis(self.duplicate_window_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    /// Records whose embedded timestamp is older than this are deleted.
    pub keep_days: u32,
    /// Sweep cadence (ms). The first sweep runs immediately on start.
    pub sweep_interval_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            keep_days: 30,
            sweep_interval_ms: 60 * 60 * 1_000,
        }
    }
}

impl RetentionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1_000))
    }
}
