//! Core pipeline for Dropzone.
//!
//! Files dropped into watched folders flow through a fixed sequence of stages:
//!
//! ```text
//! notify event -> stability tracker -> readiness gate
//!     -> { rule router (copy) | baseline correlator (record / rename) }
//!     -> dispatch queue -> plugin loader & invoker
//! ```
//!
//! The [`orchestrator::Orchestrator`] wires one pipeline per configured use
//! case and owns start/stop. Every stage is usable on its own, which is how
//! the unit tests exercise them.

pub mod baseline;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod plugin;
pub mod readiness;
pub mod retention;
pub mod router;
pub mod watch;

pub use baseline::{BaselineCorrelator, BaselineRecord};
pub use config::PipelineTuning;
pub use dispatch::{DispatchQueue, DispatchReport, DispatchStatus};
pub use error::{DropzoneError, Result};
pub use orchestrator::{
    BaselineSettings, ClassificationSettings, Orchestrator, OrchestratorSettings, UploadSettings,
};
pub use plugin::{
    FileProcessor, PluginDescriptor, PluginError, PluginHost, PluginLoader, PluginRegistry,
    ProcessorResolver,
};
pub use readiness::{Readiness, ReadinessGate};
pub use router::{RouteOutcome, Rule, RuleRouter};
pub use watch::{ChangeKind, DirectoryWatcher, RawEvent, WatchTarget};
