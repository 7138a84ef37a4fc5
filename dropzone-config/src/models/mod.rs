pub mod plugins;

use std::path::PathBuf;

use dropzone_core::{
    BaselineSettings, ClassificationSettings, OrchestratorSettings, PipelineTuning, Rule,
    UploadSettings, WatchTarget,
};
use serde::{Deserialize, Serialize};

use plugins::PluginsConfig;

/// Top-level agent configuration.
///
/// Every section is optional; an empty file yields an agent with no
/// pipelines, which is valid but idle.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Enable debug-level logging unless `RUST_LOG` says otherwise.
    pub debug: bool,
    /// Directory for daily-rolling log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
    /// Rule-based copying out of drop folders.
    pub classification: Option<ClassificationConfig>,
    /// Baseline record creation and comparison-file tagging.
    pub baseline: Option<BaselineConfig>,
    /// One dispatch pipeline per entry.
    pub uploads: Vec<UploadConfig>,
    pub plugins: PluginsConfig,
    /// Timing knobs shared by every pipeline.
    pub tuning: PipelineTuning,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub targets: Vec<WatchTarget>,
    /// Ordered; the first rule whose pattern matches the file name wins.
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Folders whose files carry a `Date and Time:` label.
    pub sources: Vec<WatchTarget>,
    /// Records are written to `<base_folder>/Baseline`.
    pub base_folder: PathBuf,
    /// Folders holding pending `_#1_` files to tag.
    pub comparison_folders: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    /// Use-case name; appears in logs and dispatch reports.
    pub name: String,
    pub targets: Vec<WatchTarget>,
    /// Registered plugin name (case-insensitive).
    pub plugin: String,
    /// Handed to plugins exposing the `(path, config)` entry.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    /// Wait for a matching baseline record before dispatch.
    #[serde(default)]
    pub correlate: bool,
}

impl AgentConfig {
    /// Settings for [`dropzone_core::Orchestrator`].
    pub fn to_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            classification: self.classification.as_ref().map(|c| ClassificationSettings {
                targets: c.targets.clone(),
                rules: c.rules.clone(),
            }),
            baseline: self.baseline.as_ref().map(|b| BaselineSettings {
                sources: b.sources.clone(),
                base_folder: b.base_folder.clone(),
                comparison_folders: b.comparison_folders.clone(),
            }),
            uploads: self
                .uploads
                .iter()
                .map(|u| UploadSettings {
                    name: u.name.clone(),
                    targets: u.targets.clone(),
                    plugin: u.plugin.clone(),
                    config_path: u.config_path.clone(),
                    correlate: u.correlate,
                })
                .collect(),
            tuning: self.tuning.clone(),
        }
    }

    /// Every folder the configuration expects to exist at start.
    pub fn watched_folders(&self) -> Vec<&PathBuf> {
        let mut folders = Vec::new();
        if let Some(classification) = &self.classification {
            folders.extend(classification.targets.iter().map(|t| &t.folder));
        }
        if let Some(baseline) = &self.baseline {
            folders.extend(baseline.sources.iter().map(|t| &t.folder));
            folders.extend(baseline.comparison_folders.iter());
        }
        for upload in &self.uploads {
            folders.extend(upload.targets.iter().map(|t| &t.folder));
        }
        folders
    }
}
