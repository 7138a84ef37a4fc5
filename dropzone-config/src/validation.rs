use std::collections::HashSet;

use dropzone_core::config::WatchConfig;
use dropzone_core::{DirectoryWatcher, DropzoneError, RuleRouter};
use thiserror::Error;

use crate::models::AgentConfig;

/// Problems that make the configuration unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("upload #{index} has no name")]
    UnnamedUpload { index: usize },
    #[error("upload name '{0}' is used more than once")]
    DuplicateUpload(String),
    #[error("upload '{upload}' does not name a plugin")]
    MissingPlugin { upload: String },
    #[error("upload '{upload}' correlates with baselines but no [baseline] section is configured")]
    CorrelationWithoutBaseline { upload: String },
    #[error(transparent)]
    Pipeline(#[from] DropzoneError),
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

/// Check `config` before starting pipelines. Hard errors are returned as
/// `Err`; everything the agent can still run with becomes a warning.
///
/// `registered` lists plugin names known to the registry library.
pub fn validate(config: &AgentConfig, registered: &[String]) -> Result<ConfigWarnings, ConfigError> {
    let mut warnings = ConfigWarnings::default();
    let watch = WatchConfig::default();

    if let Some(classification) = &config.classification {
        RuleRouter::new(&classification.rules)?;
        DirectoryWatcher::new(classification.targets.clone(), &watch)?;

        if classification.rules.is_empty() {
            warnings.push("classification is configured without rules; no file will be copied");
        }
        let mut seen = HashSet::new();
        for (index, rule) in classification.rules.iter().enumerate() {
            if !seen.insert(rule.pattern.as_str()) {
                warnings.push_with_hint(
                    format!("rule #{} repeats pattern '{}'", index + 1, rule.pattern),
                    "the first matching rule wins, so this rule never applies",
                );
            }
        }
    }

    if let Some(baseline) = &config.baseline {
        DirectoryWatcher::new(baseline.sources.clone(), &watch)?;
        if baseline.comparison_folders.is_empty() {
            warnings.push("baseline has no comparison folders; records will only be written");
        }
    }

    let mut names = HashSet::new();
    for (index, upload) in config.uploads.iter().enumerate() {
        let name = upload.name.trim();
        if name.is_empty() {
            return Err(ConfigError::UnnamedUpload { index: index + 1 });
        }
        if !names.insert(name.to_ascii_lowercase()) {
            return Err(ConfigError::DuplicateUpload(name.to_string()));
        }
        if upload.plugin.trim().is_empty() {
            return Err(ConfigError::MissingPlugin {
                upload: name.to_string(),
            });
        }
        if upload.correlate && config.baseline.is_none() {
            return Err(ConfigError::CorrelationWithoutBaseline {
                upload: name.to_string(),
            });
        }
        DirectoryWatcher::new(upload.targets.clone(), &watch)?;

        let known = config.plugins.declares(&upload.plugin)
            || registered
                .iter()
                .any(|registered| registered.eq_ignore_ascii_case(&upload.plugin));
        if !known {
            warnings.push_with_hint(
                format!("upload '{}' uses unknown plugin '{}'", name, upload.plugin),
                "register it with `dropzone-agent plugins add <module>` or list it under [plugins.modules]",
            );
        }
        if let Some(config_path) = &upload.config_path
            && !config_path.is_file()
        {
            warnings.push(format!(
                "upload '{}' plugin config {} does not exist",
                name,
                config_path.display()
            ));
        }
    }

    for folder in config.watched_folders() {
        if !folder.is_dir() {
            warnings.push_with_hint(
                format!("folder {} does not exist", folder.display()),
                "it is skipped until it exists and the agent is restarted",
            );
        }
    }

    for (name, path) in &config.plugins.modules {
        if !path.is_file() {
            warnings.push(format!("plugin module '{}' not found at {}", name, path.display()));
        }
    }

    Ok(warnings)
}
