//! Rule router for the classification use case: copy a ready file into the
//! destination of the first rule whose pattern matches its name.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{DropzoneError, Result};

/// Regex over the file name, and where matching files are copied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub pattern: String,
    pub destination: PathBuf,
}

impl Rule {
    pub fn new(pattern: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            pattern: pattern.into(),
            destination: destination.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Copied { destination: PathBuf },
    Unmatched,
    Failed { destination: PathBuf, error: String },
}

#[derive(Debug)]
struct CompiledRule {
    regex: Regex,
    destination: PathBuf,
}

/// Ordered rules; the first match wins.
#[derive(Debug)]
pub struct RuleRouter {
    rules: Vec<CompiledRule>,
}

impl RuleRouter {
    pub fn new(rules: &[Rule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|regex| CompiledRule {
                        regex,
                        destination: rule.destination.clone(),
                    })
                    .map_err(|err| DropzoneError::Pattern {
                        pattern: rule.pattern.clone(),
                        message: err.to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Destination folder of the first rule matching `file_name`.
    pub fn route(&self, file_name: &str) -> Option<&Path> {
        self.rules
            .iter()
            .find(|rule| rule.regex.is_match(file_name))
            .map(|rule| rule.destination.as_path())
    }

    /// Copy `source` to its routed destination, overwriting a same-named
    /// file. The source is left in place.
    pub fn apply(&self, source: &Path) -> RouteOutcome {
        let Some(file_name) = source.file_name() else {
            return RouteOutcome::Unmatched;
        };
        let name = file_name.to_string_lossy();

        let Some(folder) = self.route(&name) else {
            info!(file = %name, "no rule matched; leaving file in place");
            return RouteOutcome::Unmatched;
        };

        let destination = folder.join(file_name);
        let copied = fs::create_dir_all(folder).and_then(|()| fs::copy(source, &destination));
        match copied {
            Ok(bytes) => {
                info!(
                    source = %source.display(),
                    destination = %destination.display(),
                    bytes,
                    "classified file"
                );
                RouteOutcome::Copied { destination }
            }
            Err(err) => {
                error!(
                    source = %source.display(),
                    destination = %destination.display(),
                    error = %err,
                    "failed to copy file"
                );
                RouteOutcome::Failed {
                    destination,
                    error: err.to_string(),
                }
            }
        }
    }
}
