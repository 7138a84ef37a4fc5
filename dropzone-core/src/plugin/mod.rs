//! Dynamically loaded processing modules.
//!
//! Plugins are WebAssembly modules compiled from an in-memory copy of their
//! bytes, so the file on disk can be replaced or deleted while the host runs.
//! A module satisfies the processing contract when it exports:
//!
//! * `memory`
//! * `alloc(len: i32) -> i32`, returning a pointer the host writes input into
//! * `process_and_upload`, taking either `(path_ptr, path_len, cfg_ptr,
//!   cfg_len)` or `(path_ptr, path_len)` and returning nothing or an `i32`
//!   status where non-zero means failure
//!
//! An optional `init()` export is called once per instantiation. Modules may
//! import the `env` host functions (`log`, `file_len`, `file_read`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod host;
pub mod loader;
pub mod registry;

pub use loader::{EntrySignature, LoadedModule, PluginLoader};
pub use registry::PluginRegistry;

/// Failures raised while loading or invoking a plugin module.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("plugin module not found: {0}")]
    ModuleNotFound(PathBuf),

    #[error("failed to read plugin module {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to compile plugin module {path}: {message}")]
    Compile { path: PathBuf, message: String },

    #[error("plugin module {path} does not satisfy the processing contract: {reason}")]
    MissingContract { path: PathBuf, reason: String },

    #[error("failed to instantiate plugin module {path}: {message}")]
    Instantiate { path: PathBuf, message: String },

    #[error("plugin trapped while processing {file}: {message}")]
    Trap { file: PathBuf, message: String },

    #[error("plugin reported status {status} for {file}")]
    Rejected { file: PathBuf, status: i32 },

    #[error("no plugin registered under name '{0}'")]
    Unresolved(String),

    #[error("a plugin named '{0}' is already registered")]
    Duplicate(String),

    #[error("plugin registry error: {0}")]
    Registry(String),

    #[error("plugin invocation aborted: {0}")]
    Aborted(String),
}

/// Name, version and location of a registered module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            path: path.into(),
        }
    }
}

/// Host-side view of a processing module.
///
/// `process` blocks until the module returns; callers run it on a blocking
/// thread.
pub trait FileProcessor: Send + Sync {
    fn process(&self, file: &Path, config: Option<&Path>) -> Result<(), PluginError>;
}

/// Maps a configured module name to something that can process files.
pub trait ProcessorResolver: Send + Sync {
    fn resolve_processor(&self, name: &str) -> Result<Arc<dyn FileProcessor>, PluginError>;
}

/// Registry and loader bundled together; shared by every upload pipeline.
#[derive(Clone)]
pub struct PluginHost {
    registry: Arc<PluginRegistry>,
    loader: Arc<PluginLoader>,
}

impl fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHost")
            .field("registry", &self.registry)
            .field("cached_modules", &self.loader.cached_len())
            .finish()
    }
}

impl PluginHost {
    pub fn new(registry: Arc<PluginRegistry>, loader: Arc<PluginLoader>) -> Self {
        Self { registry, loader }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }
}

impl ProcessorResolver for PluginHost {
    fn resolve_processor(&self, name: &str) -> Result<Arc<dyn FileProcessor>, PluginError> {
        let descriptor = self
            .registry
            .resolve(name)
            .ok_or_else(|| PluginError::Unresolved(name.to_string()))?;
        Ok(Arc::new(WasmProcessor {
            loader: Arc::clone(&self.loader),
            module_path: descriptor.path,
        }))
    }
}

/// A module path bound to the shared loader.
#[derive(Debug)]
pub struct WasmProcessor {
    loader: Arc<PluginLoader>,
    module_path: PathBuf,
}

impl WasmProcessor {
    pub fn new(loader: Arc<PluginLoader>, module_path: impl Into<PathBuf>) -> Self {
        Self {
            loader,
            module_path: module_path.into(),
        }
    }
}

impl FileProcessor for WasmProcessor {
    fn process(&self, file: &Path, config: Option<&Path>) -> Result<(), PluginError> {
        self.loader.invoke(&self.module_path, file, config)
    }
}

#[cfg(test)]
pub(crate) mod test_modules {
    use std::borrow::Cow;
    use std::fs;
    use std::path::{Path, PathBuf};

    use wasm_encoder::{CustomSection, Encode, Section};

    pub const ACCEPT: &str = r#"(module
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

    pub const PATH_ONLY: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "alloc") (param i32) (result i32)
    i32.const 2048)
  (func (export "process_and_upload") (param i32 i32)))"#;

    pub const TRAP: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "alloc") (param i32) (result i32)
    i32.const 2048)
  (func (export "process_and_upload") (param i32 i32 i32 i32) (result i32)
    unreachable))"#;

    pub const STATUS_THREE: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "alloc") (param i32) (result i32)
    i32.const 2048)
  (func (export "process_and_upload") (param i32 i32) (result i32)
    i32.const 3))"#;

    pub const REQUIRES_INIT: &str = r#"(module
  (memory (export "memory") 1)
  (global $armed (mut i32) (i32.const 0))
  (func (export "init")
    i32.const 1
    global.set $armed)
  (func (export "alloc") (param i32) (result i32)
    i32.const 2048)
  (func (export "process_and_upload") (param i32 i32) (result i32)
    global.get $armed
    i32.eqz))"#;

    pub const EXPECTS_ABSOLUTE_PATH: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "alloc") (param i32) (result i32)
    i32.const 2048)
  (func (export "process_and_upload") (param $ptr i32) (param $len i32) (result i32)
    local.get $ptr
    i32.load8_u
    i32.const 47
    i32.ne))"#;

    pub const NO_CONTRACT: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "run")))"#;

    pub fn write(dir: &Path, name: &str, wat: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, wat).expect("write module");
        path
    }

    /// Read the dispatched file through the host imports. Logs, then returns
    /// 0 when the file is exactly `OK`, 2 on a length mismatch and 1 otherwise.
    pub const READS_INPUT: &str = r#"(module
  (import "env" "log" (func $log (param i32 i32 i32)))
  (import "env" "file_len" (func $file_len (param i32) (result i64)))
  (import "env" "file_read" (func $file_read (param i32 i64 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "checking input")
  (func (export "alloc") (param i32) (result i32)
    i32.const 2048)
  (func (export "process_and_upload") (param i32 i32) (result i32)
    (call $log (i32.const 1) (i32.const 16) (i32.const 14))
    (if (i64.ne (call $file_len (i32.const 0)) (i64.const 2))
      (then (return (i32.const 2))))
    (if (i32.ne (call $file_read (i32.const 0) (i64.const 0) (i32.const 4096) (i32.const 2)) (i32.const 2))
      (then (return (i32.const 2))))
    (i32.ne
      (i32.or
        (i32.load8_u (i32.const 4096))
        (i32.shl (i32.load8_u (i32.const 4097)) (i32.const 8)))
      (i32.const 19279))))"#;

    pub const UNKNOWN_IMPORT: &str = r#"(module
  (import "env" "open_socket" (func (param i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "alloc") (param i32) (result i32)
    i32.const 2048)
  (func (export "process_and_upload") (param i32 i32)))"#;

    /// Compile `wat` and append `plugin.name` / `plugin.version` sections.
    pub fn with_metadata(wat: &str, name: &str, version: &str) -> Vec<u8> {
        let mut bytes = wasmer::wat2wasm(wat.as_bytes())
            .expect("valid wat")
            .into_owned();
        for (section, value) in [
            (super::loader::NAME_SECTION, name),
            (super::loader::VERSION_SECTION, version),
        ] {
            let custom = CustomSection {
                name: Cow::Borrowed(section),
                data: Cow::Borrowed(value.as_bytes()),
            };
            bytes.push(custom.id());
            custom.encode(&mut bytes);
        }
        bytes
    }
}
