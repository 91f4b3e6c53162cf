//! Mount registry with longest-prefix routing and load-balanced groups.
//!
//! Every registered backend lives at a virtual path. Mounts sharing a path
//! form a [`MountGroup`]; resolving a path inside a group hands out its
//! members round-robin.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::path;

/// Suffix that makes a mount join the group of its base path.
pub const BALANCE_SUFFIX: &str = ".balance";

/// Unique name of a registered mount.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountId(String);

impl MountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One registered storage instance.
pub struct Mount {
    id: MountId,
    path: String,
    group_path: String,
    driver: String,
    order: i32,
    no_cache: bool,
    only_proxy: bool,
    seq: u64,
    backend: Arc<dyn StorageBackend>,
}

impl Mount {
    /// Create a mount. Cache flags start from the driver's own config.
    pub fn new(
        id: impl Into<MountId>,
        mount_path: &str,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        let config = backend.config();
        let path = path::normalize(mount_path);
        let group_path = group_path_of(&path);
        Self {
            id: id.into(),
            path,
            group_path,
            driver: config.name,
            order: 0,
            no_cache: config.no_cache,
            only_proxy: config.only_proxy,
            seq: 0,
            backend,
        }
    }

    /// Set the load-balance ordinal.
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Force listings of this mount to bypass the cache. A driver that
    /// demands `no_cache` cannot be overridden back to cached.
    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache |= no_cache;
        self
    }

    /// Require content to be proxied.
    pub fn with_only_proxy(mut self, only_proxy: bool) -> Self {
        self.only_proxy |= only_proxy;
        self
    }

    pub fn id(&self) -> &MountId {
        &self.id
    }

    /// The path as registered (may carry the balance suffix).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The path this mount serves.
    pub fn group_path(&self) -> &str {
        &self.group_path
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn no_cache(&self) -> bool {
        self.no_cache
    }

    pub fn only_proxy(&self) -> bool {
        self.only_proxy
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("driver", &self.driver)
            .field("order", &self.order)
            .field("no_cache", &self.no_cache)
            .finish()
    }
}

fn group_path_of(normalized: &str) -> String {
    match normalized.strip_suffix(BALANCE_SUFFIX) {
        Some(base) if !base.is_empty() && !base.ends_with('/') => base.to_string(),
        _ => normalized.to_string(),
    }
}

/// Mounts sharing one virtual path.
#[derive(Debug, Default)]
pub struct MountGroup {
    members: Vec<Arc<Mount>>,
    cursor: AtomicUsize,
}

impl MountGroup {
    /// Pick the next member round-robin.
    fn next(&self) -> Option<Arc<Mount>> {
        if self.members.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.members.len();
        Some(Arc::clone(&self.members[i]))
    }

    fn insert(&mut self, mount: Arc<Mount>) {
        self.members.push(mount);
        self.members.sort_by_key(|m| (m.order, m.seq));
    }

    pub fn members(&self) -> &[Arc<Mount>] {
        &self.members
    }
}

/// A path routed to its backend.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub mount: Arc<Mount>,
    /// Path inside the backend, always absolute.
    pub path: String,
}

#[derive(Debug, Default)]
struct RegistryState {
    groups: BTreeMap<String, MountGroup>,
    by_id: HashMap<MountId, Arc<Mount>>,
    next_seq: u64,
}

/// Routes virtual paths to registered mounts.
///
/// Mount paths are matched by longest prefix: with `/a` and `/a/b` both
/// registered, `/a/b/c` resolves to `/a/b` with relative path `/c`.
#[derive(Debug, Default)]
pub struct MountRegistry {
    state: RwLock<RegistryState>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mount, appending it to the group at its path.
    pub fn register(&self, mut mount: Mount) -> StorageResult<Arc<Mount>> {
        let mut state = self.state.write();
        if state.by_id.contains_key(&mount.id) {
            return Err(StorageError::conflict(format!(
                "mount id already registered: {}",
                mount.id
            )));
        }
        mount.seq = state.next_seq;
        state.next_seq += 1;

        let mount = Arc::new(mount);
        state
            .groups
            .entry(mount.group_path.clone())
            .or_default()
            .insert(Arc::clone(&mount));
        state.by_id.insert(mount.id.clone(), Arc::clone(&mount));

        info!(mount = %mount.id, path = %mount.group_path, driver = %mount.driver, "mount registered");
        Ok(mount)
    }

    /// Remove a mount. Its path disappears once its group is empty.
    pub fn unregister(&self, id: &MountId) -> StorageResult<Arc<Mount>> {
        let mut state = self.state.write();
        let mount = state
            .by_id
            .remove(id)
            .ok_or_else(|| StorageError::not_found(format!("mount {id}")))?;

        let now_empty = match state.groups.get_mut(&mount.group_path) {
            Some(group) => {
                group.members.retain(|m| m.id != *id);
                group.members.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.groups.remove(&mount.group_path);
        }

        info!(mount = %id, path = %mount.group_path, "mount unregistered");
        Ok(mount)
    }

    /// Route a virtual path to a mount and the path inside it.
    pub fn resolve(&self, virtual_path: &str) -> StorageResult<Resolved> {
        self.route(virtual_path, None)
    }

    /// Like [`resolve`](Self::resolve), but stays on `mount` when the path
    /// falls in its group, without advancing the group's rotation.
    ///
    /// Operations touching two paths resolve the second one this way, so
    /// both land on the same member of a balanced group.
    pub fn resolve_near(&self, virtual_path: &str, mount: &Arc<Mount>) -> StorageResult<Resolved> {
        self.route(virtual_path, Some(mount))
    }

    fn route(&self, virtual_path: &str, prefer: Option<&Arc<Mount>>) -> StorageResult<Resolved> {
        let normalized = path::normalize(virtual_path);
        let state = self.state.read();

        // Keys are unique, so the longest match is unambiguous.
        let best = state
            .groups
            .iter()
            .filter_map(|(mount_path, group)| {
                path::strip_prefix(&normalized, mount_path).map(|rest| (mount_path, group, rest))
            })
            .max_by_key(|(mount_path, _, _)| mount_path.len());

        let Some((mount_path, group, rest)) = best else {
            return Err(StorageError::not_found(format!(
                "no mount for {normalized}"
            )));
        };
        if let Some(m) = prefer.filter(|m| m.group_path == *mount_path) {
            return Ok(Resolved {
                mount: Arc::clone(m),
                path: rest,
            });
        }
        let mount = group
            .next()
            .ok_or_else(|| StorageError::not_found(normalized.clone()))?;
        Ok(Resolved { mount, path: rest })
    }

    /// Mounts whose path lies strictly beneath `virtual_path`.
    pub fn child_mounts(&self, virtual_path: &str) -> Vec<Arc<Mount>> {
        let normalized = path::normalize(virtual_path);
        let state = self.state.read();
        state
            .groups
            .iter()
            .filter(|(mount_path, _)| path::is_strict_descendant(mount_path, &normalized))
            .flat_map(|(_, group)| group.members.iter().cloned())
            .collect()
    }

    /// Distinct next path segments of mounts beneath `virtual_path`.
    ///
    /// These are the entries of the virtual directory at that path.
    pub fn child_names(&self, virtual_path: &str) -> Vec<String> {
        let normalized = path::normalize(virtual_path);
        let state = self.state.read();
        let names: BTreeSet<String> = state
            .groups
            .keys()
            .filter_map(|mount_path| {
                let rest = path::strip_prefix(mount_path, &normalized)?;
                rest.trim_start_matches('/')
                    .split('/')
                    .next()
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .collect();
        names.into_iter().collect()
    }

    /// True when the path has no owning mount but has descendants.
    pub fn is_virtual_dir(&self, virtual_path: &str) -> bool {
        !self.has_owner(virtual_path) && !self.child_names(virtual_path).is_empty()
    }

    fn has_owner(&self, virtual_path: &str) -> bool {
        let normalized = path::normalize(virtual_path);
        self.state
            .read()
            .groups
            .keys()
            .any(|mount_path| path::strip_prefix(&normalized, mount_path).is_some())
    }

    /// Look up a mount by id.
    pub fn get(&self, id: &MountId) -> Option<Arc<Mount>> {
        self.state.read().by_id.get(id).cloned()
    }

    /// All mounts, by group path then balance order.
    pub fn mounts(&self) -> Vec<Arc<Mount>> {
        let state = self.state.read();
        state
            .groups
            .values()
            .flat_map(|g| g.members.iter().cloned())
            .collect()
    }
}
