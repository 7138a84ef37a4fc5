use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{PluginDescriptor, PluginError, PluginLoader};

/// File in the library directory that lists registered modules.
pub const MANIFEST_FILE: &str = "plugins.json";
const DEFAULT_VERSION: &str = "0.0.0";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    plugins: Vec<PluginDescriptor>,
}

#[derive(Debug, Clone)]
struct Entry {
    descriptor: PluginDescriptor,
    /// Copied into the library directory by `register` (as opposed to
    /// declared in place from configuration).
    managed: bool,
}

/// Named plugin modules, keyed case-insensitively.
pub struct PluginRegistry {
    library_dir: PathBuf,
    loader: Arc<PluginLoader>,
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("PluginRegistry");
        debug.field("library_dir", &self.library_dir);
        match self.entries.try_read() {
            Some(guard) => debug.field("plugins", &guard.len()),
            None => debug.field("plugins", &"<locked>"),
        };
        debug.finish()
    }
}

impl PluginRegistry {
    /// Open (creating if needed) the library directory and load its manifest.
    pub fn open(library_dir: impl Into<PathBuf>, loader: Arc<PluginLoader>) -> Result<Self, PluginError> {
        let library_dir = library_dir.into();
        fs::create_dir_all(&library_dir).map_err(|err| {
            PluginError::Registry(format!(
                "failed to create plugin library {}: {err}",
                library_dir.display()
            ))
        })?;

        let manifest = read_manifest(&library_dir.join(MANIFEST_FILE))?;
        let entries = manifest
            .plugins
            .into_iter()
            .map(|descriptor| {
                (
                    key_of(&descriptor.name),
                    Entry {
                        descriptor,
                        managed: true,
                    },
                )
            })
            .collect();

        Ok(Self {
            library_dir,
            loader,
            entries: RwLock::new(entries),
        })
    }

    pub fn library_dir(&self) -> &Path {
        &self.library_dir
    }

    /// Validate the module at `source`, copy it into the library directory and
    /// record it under its declared name.
    pub fn register(&self, source: &Path) -> Result<PluginDescriptor, PluginError> {
        let loaded = self.loader.load(source)?;

        let name = loaded
            .declared_name()
            .map(str::to_string)
            .or_else(|| file_stem(source))
            .ok_or_else(|| {
                PluginError::Registry(format!("cannot derive a name for {}", source.display()))
            })?;
        let version = loaded
            .declared_version()
            .unwrap_or(DEFAULT_VERSION)
            .to_string();
        let file_name = source.file_name().ok_or_else(|| {
            PluginError::Registry(format!("{} has no file name", source.display()))
        })?;
        let destination = self.library_dir.join(file_name);

        let mut entries = self.entries.write();
        let key = key_of(&name);
        if entries.contains_key(&key) {
            return Err(PluginError::Duplicate(name));
        }
        if entries.values().any(|entry| same_file_name(&entry.descriptor.path, &destination)) {
            return Err(PluginError::Registry(format!(
                "a module file named {} is already in the library",
                destination.display()
            )));
        }

        if !same_location(source, &destination) {
            // Validation compiled the staging copy; only the library path is used from here.
            self.loader.evict(source);
            fs::copy(source, &destination).map_err(|err| PluginError::Io {
                path: destination.clone(),
                source: err,
            })?;
        }

        let descriptor = PluginDescriptor::new(name, version, destination);
        entries.insert(
            key,
            Entry {
                descriptor: descriptor.clone(),
                managed: true,
            },
        );
        self.persist(&entries)?;

        info!(
            plugin = %descriptor.name,
            version = %descriptor.version,
            path = %descriptor.path.display(),
            "registered plugin"
        );
        Ok(descriptor)
    }

    /// Add a module that lives outside the library directory, e.g. one named in
    /// configuration. Declared modules are not written to the manifest.
    pub fn declare(&self, name: &str, path: impl Into<PathBuf>) -> Result<(), PluginError> {
        let path = path.into();
        let mut entries = self.entries.write();
        let key = key_of(name);
        if let Some(existing) = entries.get(&key) {
            if existing.descriptor.path == path {
                return Ok(());
            }
            return Err(PluginError::Duplicate(name.to_string()));
        }

        let version = self
            .loader
            .load(&path)
            .ok()
            .and_then(|loaded| loaded.declared_version().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());

        entries.insert(
            key,
            Entry {
                descriptor: PluginDescriptor::new(name, version, path),
                managed: false,
            },
        );
        Ok(())
    }

    /// Forget a module; managed modules also have their library copy deleted.
    pub fn remove(&self, name: &str) -> Result<PluginDescriptor, PluginError> {
        let mut entries = self.entries.write();
        let entry = entries
            .remove(&key_of(name))
            .ok_or_else(|| PluginError::Unresolved(name.to_string()))?;

        if entry.managed {
            match fs::remove_file(&entry.descriptor.path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(
                    path = %entry.descriptor.path.display(),
                    error = %err,
                    "failed to delete plugin module"
                ),
            }
            self.persist(&entries)?;
        }
        self.loader.evict(&entry.descriptor.path);

        info!(plugin = %entry.descriptor.name, "removed plugin");
        Ok(entry.descriptor)
    }

    pub fn resolve(&self, name: &str) -> Option<PluginDescriptor> {
        self.entries
            .read()
            .get(&key_of(name))
            .map(|entry| entry.descriptor.clone())
    }

    pub fn list(&self) -> Vec<PluginDescriptor> {
        self.entries
            .read()
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn persist(&self, entries: &BTreeMap<String, Entry>) -> Result<(), PluginError> {
        let manifest = Manifest {
            plugins: entries
                .values()
                .filter(|entry| entry.managed)
                .map(|entry| entry.descriptor.clone())
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| PluginError::Registry(format!("failed to encode manifest: {err}")))?;

        let target = self.library_dir.join(MANIFEST_FILE);
        let staging = self.library_dir.join(format!("{MANIFEST_FILE}.tmp"));
        fs::write(&staging, json)
            .and_then(|()| fs::rename(&staging, &target))
            .map_err(|err| PluginError::Io {
                path: target,
                source: err,
            })
    }
}

fn read_manifest(path: &Path) -> Result<Manifest, PluginError> {
    match fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw).map_err(|err| {
            PluginError::Registry(format!("invalid manifest {}: {err}", path.display()))
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Manifest::default()),
        Err(err) => Err(PluginError::Io {
            path: path.to_path_buf(),
            source: err,
        }),
    }
}

fn key_of(name: &str) -> String {
    name.trim().to_lowercase()
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
}

fn same_file_name(a: &Path, b: &Path) -> bool {
    match (a.file_name(), b.file_name()) {
        (Some(a), Some(b)) => a.to_string_lossy().eq_ignore_ascii_case(&b.to_string_lossy()),
        _ => false,
    }
}

fn same_location(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::test_modules;
    use tempfile::tempdir;

    fn registry(dir: &Path) -> PluginRegistry {
        PluginRegistry::open(dir.join("Library"), Arc::new(PluginLoader::new())).unwrap()
    }

    #[test]
    fn register_copies_module_and_persists_manifest() {
        let dir = tempdir().unwrap();
        let source = test_modules::write(dir.path(), "uploader.wat", test_modules::ACCEPT);
        let registry = registry(dir.path());

        let descriptor = registry.register(&source).expect("register");
        assert_eq!(descriptor.name, "uploader");
        assert_eq!(descriptor.version, "0.0.0");
        assert_eq!(descriptor.path, dir.path().join("Library").join("uploader.wat"));
        assert!(descriptor.path.exists());
        assert!(source.exists(), "source module is left in place");

        let reopened = PluginRegistry::open(dir.path().join("Library"), Arc::new(PluginLoader::new())).unwrap();
        assert_eq!(reopened.list(), vec![descriptor]);
    }

    #[test]
    fn register_does_not_keep_the_staging_module_cached() {
        let dir = tempdir().unwrap();
        let source = test_modules::write(dir.path(), "uploader.wat", test_modules::ACCEPT);
        let loader = Arc::new(PluginLoader::new());
        let registry = PluginRegistry::open(dir.path().join("Library"), Arc::clone(&loader)).unwrap();

        let descriptor = registry.register(&source).unwrap();
        assert_eq!(loader.cached_len(), 0);

        loader.load(&descriptor.path).unwrap();
        assert_eq!(loader.cached_len(), 1);
    }

    #[test]
    fn names_are_case_insensitive() {
        let dir = tempdir().unwrap();
        let source = test_modules::write(dir.path(), "Uploader.wat", test_modules::ACCEPT);
        let registry = registry(dir.path());
        registry.register(&source).unwrap();

        assert!(registry.resolve("UPLOADER").is_some());

        let other = tempdir().unwrap();
        let clash = test_modules::write(other.path(), "uploader.wat", test_modules::PATH_ONLY);
        let err = registry.register(&clash).expect_err("duplicate");
        assert!(matches!(err, PluginError::Duplicate(_)));
    }

    #[test]
    fn declared_metadata_wins_over_file_stem() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("build-output.wasm");
        fs::write(
            &source,
            test_modules::with_metadata(test_modules::ACCEPT, "csv-uploader", "2.0.1"),
        )
        .unwrap();
        let registry = registry(dir.path());

        let descriptor = registry.register(&source).unwrap();
        assert_eq!(descriptor.name, "csv-uploader");
        assert_eq!(descriptor.version, "2.0.1");
    }

    #[test]
    fn invalid_module_is_not_copied() {
        let dir = tempdir().unwrap();
        let source = test_modules::write(dir.path(), "broken.wat", test_modules::NO_CONTRACT);
        let registry = registry(dir.path());

        assert!(registry.register(&source).is_err());
        assert!(!dir.path().join("Library").join("broken.wat").exists());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_deletes_library_copy() {
        let dir = tempdir().unwrap();
        let source = test_modules::write(dir.path(), "uploader.wat", test_modules::ACCEPT);
        let registry = registry(dir.path());
        let descriptor = registry.register(&source).unwrap();

        let removed = registry.remove("Uploader").unwrap();
        assert_eq!(removed, descriptor);
        assert!(!descriptor.path.exists());
        assert!(registry.resolve("uploader").is_none());

        let err = registry.remove("uploader").expect_err("already gone");
        assert!(matches!(err, PluginError::Unresolved(_)));
    }

    #[test]
    fn declared_modules_stay_out_of_manifest() {
        let dir = tempdir().unwrap();
        let module = test_modules::write(dir.path(), "external.wat", test_modules::ACCEPT);
        let registry = registry(dir.path());

        registry.declare("Archive", &module).unwrap();
        assert_eq!(registry.resolve("archive").map(|d| d.path), Some(module.clone()));
        registry.declare("archive", &module).expect("same path is idempotent");

        let reopened = PluginRegistry::open(dir.path().join("Library"), Arc::new(PluginLoader::new())).unwrap();
        assert!(reopened.is_empty());

        registry.remove("archive").unwrap();
        assert!(module.exists(), "declared modules are never deleted");
    }
}
