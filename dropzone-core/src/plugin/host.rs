//! Host functions imported by plugin modules.
//!
//! Everything lives in the `env` namespace. A module may import any subset;
//! importing anything else is a contract violation caught at load time.
//!
//! * `log(level: i32, ptr: i32, len: i32)` writes a UTF-8 message to the
//!   agent log (0 debug, 1 info, 2 warn, 3 error)
//! * `file_len(source: i32) -> i64` size of a readable file, or -1
//! * `file_read(source: i32, offset: i64, ptr: i32, len: i32) -> i32` copies
//!   up to `len` bytes into module memory and returns how many were read, or
//!   -1 on failure
//!
//! `source` 0 is the file being dispatched and 1 the plugin's config file.
//! Nothing else on disk is reachable from a module.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use tracing::{debug, error, info, warn};
use wasmer::{
    ExternType, Function, FunctionEnv, FunctionEnvMut, Imports, Memory, Module, Store, Type,
    WasmPtr, imports,
};

pub(crate) const HOST_NAMESPACE: &str = "env";

const SOURCE_INPUT: u32 = 0;
const SOURCE_CONFIG: u32 = 1;
/// Upper bound on a single `file_read` so a module cannot make the host
/// allocate without limit.
const MAX_READ_CHUNK: u32 = 1 << 20;

/// Per-invocation state shared with host functions.
pub(crate) struct HostEnv {
    module: String,
    input: PathBuf,
    config: Option<PathBuf>,
    memory: Option<Memory>,
}

impl HostEnv {
    pub(crate) fn new(module: String, input: PathBuf, config: Option<PathBuf>) -> Self {
        Self {
            module,
            input,
            config,
            memory: None,
        }
    }

    fn source(&self, source: u32) -> Option<&PathBuf> {
        match source {
            SOURCE_INPUT => Some(&self.input),
            SOURCE_CONFIG => self.config.as_ref(),
            _ => None,
        }
    }
}

/// Build the `env` imports for one instance. The memory is attached with
/// [`attach_memory`] once the instance exists.
pub(crate) fn host_imports(store: &mut Store, env: &FunctionEnv<HostEnv>) -> Imports {
    imports! {
        HOST_NAMESPACE => {
            "log" => Function::new_typed_with_env(&mut *store, env, host_log),
            "file_len" => Function::new_typed_with_env(&mut *store, env, host_file_len),
            "file_read" => Function::new_typed_with_env(&mut *store, env, host_file_read),
        }
    }
}

pub(crate) fn attach_memory(store: &mut Store, env: &FunctionEnv<HostEnv>, memory: Memory) {
    env.as_mut(store).memory = Some(memory);
}

/// Check every import a module declares against the functions above.
pub(crate) fn check_imports(module: &Module) -> Result<(), String> {
    for import in module.imports() {
        let expected = match (import.module(), import.name()) {
            (HOST_NAMESPACE, "log") => (&[Type::I32, Type::I32, Type::I32][..], &[][..]),
            (HOST_NAMESPACE, "file_len") => (&[Type::I32][..], &[Type::I64][..]),
            (HOST_NAMESPACE, "file_read") => (
                &[Type::I32, Type::I64, Type::I32, Type::I32][..],
                &[Type::I32][..],
            ),
            (namespace, name) => {
                return Err(format!("imports unknown host function `{namespace}.{name}`"));
            }
        };

        let ExternType::Function(ty) = import.ty() else {
            return Err(format!("import `{}` must be a function", import.name()));
        };
        if (ty.params(), ty.results()) != expected {
            return Err(format!(
                "import `{}` has signature {ty}, expected {:?} -> {:?}",
                import.name(),
                expected.0,
                expected.1
            ));
        }
    }
    Ok(())
}

fn host_log(env: FunctionEnvMut<HostEnv>, level: u32, ptr: WasmPtr<u8>, len: u32) {
    let host = env.data();
    let Some(memory) = &host.memory else {
        return;
    };
    let view = memory.view(&env);
    let message = match ptr.read_utf8_string(&view, len) {
        Ok(message) => message,
        Err(err) => {
            warn!(plugin = %host.module, error = %err, "unreadable log message from plugin");
            return;
        }
    };

    match level {
        0 => debug!(plugin = %host.module, "{message}"),
        2 => warn!(plugin = %host.module, "{message}"),
        3 => error!(plugin = %host.module, "{message}"),
        _ => info!(plugin = %host.module, "{message}"),
    }
}

fn host_file_len(env: FunctionEnvMut<HostEnv>, source: u32) -> i64 {
    env.data()
        .source(source)
        .and_then(|path| path.metadata().ok())
        .and_then(|metadata| i64::try_from(metadata.len()).ok())
        .unwrap_or(-1)
}

fn host_file_read(
    mut env: FunctionEnvMut<HostEnv>,
    source: u32,
    offset: u64,
    ptr: WasmPtr<u8>,
    len: u32,
) -> i32 {
    let (host, store) = env.data_and_store_mut();
    let (Some(memory), Some(path)) = (&host.memory, host.source(source)) else {
        return -1;
    };

    let mut buffer = vec![0u8; len.min(MAX_READ_CHUNK) as usize];
    let read = File::open(path).and_then(|mut file| {
        file.seek(SeekFrom::Start(offset))?;
        file.read(&mut buffer)
    });
    let read = match read {
        Ok(read) => read,
        Err(err) => {
            debug!(plugin = %host.module, path = %path.display(), error = %err, "plugin file read failed");
            return -1;
        }
    };

    let view = memory.view(&store);
    let written = ptr
        .slice(&view, read as u32)
        .and_then(|slice| slice.write_slice(&buffer[..read]));
    match written {
        Ok(()) => read as i32,
        Err(err) => {
            debug!(plugin = %host.module, error = %err, "plugin read buffer out of bounds");
            -1
        }
    }
}
