use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use tracing::debug;
use wasmer::{
    Engine, ExternType, FunctionEnv, FunctionType, Instance, Memory, Module, Store, Type,
    TypedFunction, Value,
};

use super::PluginError;
use super::host::{HostEnv, attach_memory, check_imports, host_imports};

/// Entry operation every processing module exports.
pub const ENTRY_EXPORT: &str = "process_and_upload";
/// Custom section carrying the module's declared name.
pub const NAME_SECTION: &str = "plugin.name";
/// Custom section carrying the module's declared version.
pub const VERSION_SECTION: &str = "plugin.version";

const MEMORY_EXPORT: &str = "memory";
const ALLOC_EXPORT: &str = "alloc";
const INIT_EXPORT: &str = "init";

/// Which overload of the entry operation a module provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySignature {
    /// `(path_ptr, path_len, cfg_ptr, cfg_len)`
    PathAndConfig,
    /// `(path_ptr, path_len)`
    PathOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ModuleStamp {
    len: u64,
    modified: Option<SystemTime>,
}

/// A compiled module together with its discovered capabilities.
pub struct LoadedModule {
    module: Module,
    entry: EntrySignature,
    reports_status: bool,
    has_init: bool,
    stamp: ModuleStamp,
    declared_name: Option<String>,
    declared_version: Option<String>,
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("entry", &self.entry)
            .field("reports_status", &self.reports_status)
            .field("has_init", &self.has_init)
            .field("len", &self.stamp.len)
            .field("declared_name", &self.declared_name)
            .field("declared_version", &self.declared_version)
            .finish()
    }
}

impl LoadedModule {
    pub fn entry(&self) -> EntrySignature {
        self.entry
    }

    pub fn has_init(&self) -> bool {
        self.has_init
    }

    /// Value of the `plugin.name` custom section, if the module embeds one.
    pub fn declared_name(&self) -> Option<&str> {
        self.declared_name.as_deref()
    }

    /// Value of the `plugin.version` custom section, if the module embeds one.
    pub fn declared_version(&self) -> Option<&str> {
        self.declared_version.as_deref()
    }
}

/// Compiles plugin modules and invokes their entry operation.
///
/// Compiled modules are cached per path and recompiled when the file's size
/// or modification time changes. Every invocation gets a fresh store and
/// instance, so no state leaks between calls.
pub struct PluginLoader {
    engine: Engine,
    cache: DashMap<PathBuf, Arc<LoadedModule>>,
}

impl fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLoader")
            .field("cached_modules", &self.cache.len())
            .finish()
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginLoader {
    pub fn new() -> Self {
        Self {
            engine: Engine::default(),
            cache: DashMap::new(),
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn evict(&self, module_path: &Path) {
        self.cache.remove(module_path);
    }

    /// Compile (or fetch from cache) the module at `module_path` and verify it
    /// exposes the processing contract.
    pub fn load(&self, module_path: &Path) -> Result<Arc<LoadedModule>, PluginError> {
        let stamp = stamp_of(module_path)?;

        if let Some(cached) = self.cache.get(module_path)
            && cached.stamp == stamp
        {
            return Ok(Arc::clone(cached.value()));
        }

        // Read into memory so no handle stays open on the module file.
        let bytes = fs::read(module_path).map_err(|err| io_error(module_path, err))?;
        let loaded = Arc::new(self.compile(module_path, &bytes, stamp)?);

        debug!(
            module = %module_path.display(),
            entry = ?loaded.entry,
            has_init = loaded.has_init,
            "compiled plugin module"
        );

        self.cache
            .insert(module_path.to_path_buf(), Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Run the module's entry operation against `file`.
    pub fn invoke(
        &self,
        module_path: &Path,
        file: &Path,
        config: Option<&Path>,
    ) -> Result<(), PluginError> {
        let loaded = self.load(module_path)?;

        let mut store = Store::new(self.engine.clone());
        let env = FunctionEnv::new(
            &mut store,
            HostEnv::new(
                module_path.display().to_string(),
                file.to_path_buf(),
                config.map(Path::to_path_buf),
            ),
        );
        let imports = host_imports(&mut store, &env);
        let instance = Instance::new(&mut store, &loaded.module, &imports).map_err(|err| {
            PluginError::Instantiate {
                path: module_path.to_path_buf(),
                message: err.to_string(),
            }
        })?;

        let contract = |reason: String| PluginError::MissingContract {
            path: module_path.to_path_buf(),
            reason,
        };
        let trap = |message: String| PluginError::Trap {
            file: file.to_path_buf(),
            message,
        };

        let memory = instance
            .exports
            .get_memory(MEMORY_EXPORT)
            .map_err(|err| contract(err.to_string()))?
            .clone();
        attach_memory(&mut store, &env, memory.clone());

        if loaded.has_init {
            let init = instance
                .exports
                .get_function(INIT_EXPORT)
                .map_err(|err| contract(err.to_string()))?;
            init.call(&mut store, &[])
                .map_err(|err| trap(format!("init: {err}")))?;
        }

        let alloc: TypedFunction<i32, i32> = instance
            .exports
            .get_typed_function(&store, ALLOC_EXPORT)
            .map_err(|err| contract(err.to_string()))?;

        let path_arg = file.to_string_lossy();
        let (path_ptr, path_len) =
            write_input(&mut store, &memory, &alloc, path_arg.as_bytes()).map_err(trap)?;
        let mut args = vec![Value::I32(path_ptr), Value::I32(path_len)];

        if loaded.entry == EntrySignature::PathAndConfig {
            let config_arg = config
                .map(|path| path.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (cfg_ptr, cfg_len) = if config_arg.is_empty() {
                (0, 0)
            } else {
                write_input(&mut store, &memory, &alloc, config_arg.as_bytes()).map_err(trap)?
            };
            args.push(Value::I32(cfg_ptr));
            args.push(Value::I32(cfg_len));
        }

        let entry = instance
            .exports
            .get_function(ENTRY_EXPORT)
            .map_err(|err| contract(err.to_string()))?;
        let results = entry
            .call(&mut store, &args)
            .map_err(|err| trap(err.to_string()))?;

        if loaded.reports_status
            && let Some(Value::I32(status)) = results.first()
            && *status != 0
        {
            return Err(PluginError::Rejected {
                file: file.to_path_buf(),
                status: *status,
            });
        }

        Ok(())
    }

    fn compile(
        &self,
        module_path: &Path,
        bytes: &[u8],
        stamp: ModuleStamp,
    ) -> Result<LoadedModule, PluginError> {
        let module = Module::new(&self.engine, bytes).map_err(|err| PluginError::Compile {
            path: module_path.to_path_buf(),
            message: err.to_string(),
        })?;

        let capabilities = discover(&module).map_err(|reason| PluginError::MissingContract {
            path: module_path.to_path_buf(),
            reason,
        })?;

        let declared_name = custom_section_text(&module, NAME_SECTION);
        let declared_version = custom_section_text(&module, VERSION_SECTION);

        Ok(LoadedModule {
            module,
            entry: capabilities.entry,
            reports_status: capabilities.reports_status,
            has_init: capabilities.has_init,
            stamp,
            declared_name,
            declared_version,
        })
    }
}

struct Capabilities {
    entry: EntrySignature,
    reports_status: bool,
    has_init: bool,
}

fn discover(module: &Module) -> Result<Capabilities, String> {
    check_imports(module)?;

    let mut entry = None;
    let mut has_memory = false;
    let mut has_alloc = false;
    let mut has_init = false;

    for export in module.exports() {
        match (export.name(), export.ty()) {
            (MEMORY_EXPORT, ExternType::Memory(_)) => has_memory = true,
            (ALLOC_EXPORT, ExternType::Function(ty)) => {
                has_alloc = ty.params() == [Type::I32] && ty.results() == [Type::I32];
            }
            (INIT_EXPORT, ExternType::Function(ty)) => {
                has_init = ty.params().is_empty() && ty.results().is_empty();
            }
            (ENTRY_EXPORT, ExternType::Function(ty)) => entry = classify_entry(ty),
            _ => {}
        }
    }

    if !has_memory {
        return Err(format!("missing `{MEMORY_EXPORT}` export"));
    }
    if !has_alloc {
        return Err(format!("missing `{ALLOC_EXPORT}(i32) -> i32` export"));
    }
    let Some((entry, reports_status)) = entry else {
        return Err(format!(
            "missing `{ENTRY_EXPORT}` export taking (i32, i32) or (i32, i32, i32, i32)"
        ));
    };

    Ok(Capabilities {
        entry,
        reports_status,
        has_init,
    })
}

fn classify_entry(ty: &FunctionType) -> Option<(EntrySignature, bool)> {
    if ty.params().iter().any(|param| *param != Type::I32) {
        return None;
    }
    let entry = match ty.params().len() {
        4 => EntrySignature::PathAndConfig,
        2 => EntrySignature::PathOnly,
        _ => return None,
    };
    let reports_status = match ty.results() {
        [] => false,
        [Type::I32] => true,
        _ => return None,
    };
    Some((entry, reports_status))
}

fn custom_section_text(module: &Module, name: &str) -> Option<String> {
    module
        .custom_sections(name)
        .next()
        .and_then(|raw| String::from_utf8(raw.into_vec()).ok())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn write_input(
    store: &mut Store,
    memory: &Memory,
    alloc: &TypedFunction<i32, i32>,
    bytes: &[u8],
) -> Result<(i32, i32), String> {
    let len = i32::try_from(bytes.len()).map_err(|_| "input too large for module memory".to_string())?;
    let ptr = alloc
        .call(store, len)
        .map_err(|err| format!("alloc: {err}"))?;
    memory
        .view(&*store)
        .write(u64::from(ptr as u32), bytes)
        .map_err(|err| format!("writing input at {ptr}: {err}"))?;
    Ok((ptr, len))
}

fn stamp_of(module_path: &Path) -> Result<ModuleStamp, PluginError> {
    let metadata = fs::metadata(module_path).map_err(|err| io_error(module_path, err))?;
    if !metadata.is_file() {
        return Err(PluginError::ModuleNotFound(module_path.to_path_buf()));
    }
    Ok(ModuleStamp {
        len: metadata.len(),
        modified: metadata.modified().ok(),
    })
}

fn io_error(module_path: &Path, err: std::io::Error) -> PluginError {
    if err.kind() == ErrorKind::NotFound {
        PluginError::ModuleNotFound(module_path.to_path_buf())
    } else {
        PluginError::Io {
            path: module_path.to_path_buf(),
            source: err,
        }
    }
}
