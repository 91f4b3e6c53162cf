//! Bundled storage drivers.
//!
//! Drivers are looked up by name in a [`DriverRegistry`] and built from the
//! opaque `options` table of a mount's configuration.

mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};

/// Builds a backend from a mount's `options` table.
pub type DriverFactory = fn(&toml::Table) -> StorageResult<Arc<dyn StorageBackend>>;

/// Known drivers by name.
#[derive(Clone)]
pub struct DriverRegistry {
    factories: BTreeMap<String, DriverFactory>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl DriverRegistry {
    /// A registry with no drivers.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry with the `memory` and `local` drivers.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", build_memory);
        registry.register("local", build_local);
        registry
    }

    /// Add or replace a driver.
    pub fn register(&mut self, name: impl Into<String>, factory: DriverFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Construct a backend.
    pub fn build(&self, driver: &str, options: &toml::Table) -> StorageResult<Arc<dyn StorageBackend>> {
        let factory = self
            .factories
            .get(driver)
            .ok_or_else(|| StorageError::not_supported(format!("unknown driver: {driver}")))?;
        factory(options).map_err(|e| e.context(format!("driver {driver}")))
    }

    /// Names of all known drivers.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

fn option_str<'a>(options: &'a toml::Table, key: &str) -> StorageResult<Option<&'a str>> {
    match options.get(key) {
        None => Ok(None),
        Some(toml::Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(StorageError::other(format!(
            "option {key} must be a string, got {}",
            other.type_str()
        ))),
    }
}

fn option_bool(options: &toml::Table, key: &str) -> StorageResult<bool> {
    match options.get(key) {
        None => Ok(false),
        Some(toml::Value::Boolean(b)) => Ok(*b),
        Some(other) => Err(StorageError::other(format!(
            "option {key} must be a boolean, got {}",
            other.type_str()
        ))),
    }
}

fn option_secs(options: &toml::Table, key: &str) -> StorageResult<Option<Duration>> {
    match options.get(key) {
        None => Ok(None),
        Some(toml::Value::Integer(n)) if *n > 0 => Ok(Some(Duration::from_secs(*n as u64))),
        Some(other) => Err(StorageError::other(format!(
            "option {key} must be a positive integer, got {other}"
        ))),
    }
}

/// `memory`: options `link_expiry_secs` (integer), `no_cache` (bool).
fn build_memory(options: &toml::Table) -> StorageResult<Arc<dyn StorageBackend>> {
    let mut backend = MemoryBackend::new().with_no_cache(option_bool(options, "no_cache")?);
    if let Some(expiry) = option_secs(options, "link_expiry_secs")? {
        backend = backend.with_link_expiry(expiry);
    }
    Ok(Arc::new(backend))
}

/// `local`: options `root` (required path), `read_only` (bool).
fn build_local(options: &toml::Table) -> StorageResult<Arc<dyn StorageBackend>> {
    let root = option_str(options, "root")?
        .ok_or_else(|| StorageError::other("local driver requires a root option"))?;
    let root = std::path::Path::new(root);
    if !root.is_dir() {
        return Err(StorageError::not_a_folder(root.display().to_string()));
    }
    Ok(if option_bool(options, "read_only")? {
        Arc::new(LocalBackend::read_only(root))
    } else {
        Arc::new(LocalBackend::new(root))
    })
}
