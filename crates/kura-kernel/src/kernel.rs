//! The Kernel: composition root of kura.
//!
//! A kernel owns:
//! - The mount registry and the drivers that populate it
//! - The operations layer and its caches
//! - The task engine and the copy orchestrator built on it
//! - The search and signer slots
//!
//! Nothing is global; every component receives what it needs from here.

use std::sync::Arc;
use tracing::info;

use crate::backends::DriverRegistry;
use crate::config::{KuraConfig, MountConfig};
use crate::copy::CopyOrchestrator;
use crate::error::StorageResult;
use crate::fs::Fs;
use crate::mount::{Mount, MountId, MountRegistry};
use crate::ops::Ops;
use crate::search::{MemoryIndex, SearchSlot};
use crate::sign::{KeyedSigner, SignError, SignerSlot};
use crate::tasks::TaskManager;

/// The storage kernel.
pub struct Kernel {
    registry: Arc<MountRegistry>,
    ops: Arc<Ops>,
    fs: Fs,
    tasks: TaskManager,
    search: Arc<SearchSlot>,
    signer: SignerSlot,
    drivers: DriverRegistry,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("mounts", &self.registry.mounts().len())
            .field("tasks", &self.tasks)
            .field("signer", &self.signer)
            .field("drivers", &self.drivers)
            .finish()
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(&KuraConfig::default())
    }
}

impl Kernel {
    /// Build a kernel from configuration, without any mounts.
    ///
    /// Installs the signer when a secret is configured. The search index is
    /// installed by [`from_config`](Self::from_config), which can await its
    /// setup.
    pub fn new(config: &KuraConfig) -> Self {
        let search = Arc::new(SearchSlot::new());
        search.set_auto_update(config.search.auto_update);

        let registry = Arc::new(MountRegistry::new());
        let ops = Arc::new(Ops::new(config.cache.list_ttl(), Arc::clone(&search)));
        let tasks = TaskManager::new(config.tasks.max_concurrency);
        let copier = CopyOrchestrator::new(Arc::clone(&ops), tasks.clone());
        let fs = Fs::new(Arc::clone(&registry), Arc::clone(&ops), copier);

        let signer = SignerSlot::new(config.sign.link_expiration());
        if let Some(secret) = &config.sign.secret {
            signer.init(Arc::new(KeyedSigner::new(secret)));
        }

        Self {
            registry,
            ops,
            fs,
            tasks,
            search,
            signer,
            drivers: DriverRegistry::builtin(),
        }
    }

    /// Build a kernel and register every configured mount.
    pub async fn from_config(config: &KuraConfig) -> StorageResult<Self> {
        let kernel = Self::new(config);
        if config.search.enabled {
            kernel.search.init(Arc::new(MemoryIndex::new())).await;
        }
        for mount in &config.mounts {
            kernel.mount_config(mount)?;
        }
        info!(
            mounts = config.mounts.len(),
            max_concurrency = config.tasks.max_concurrency,
            "kernel ready"
        );
        Ok(kernel)
    }

    /// Replace the driver registry (to add custom drivers).
    pub fn with_drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    // ========================================================================
    // Components
    // ========================================================================

    /// The virtual-path filesystem.
    pub fn fs(&self) -> &Fs {
        &self.fs
    }

    pub fn registry(&self) -> &Arc<MountRegistry> {
        &self.registry
    }

    pub fn ops(&self) -> &Arc<Ops> {
        &self.ops
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn search(&self) -> &Arc<SearchSlot> {
        &self.search
    }

    pub fn signer(&self) -> &SignerSlot {
        &self.signer
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    // ========================================================================
    // Mounts
    // ========================================================================

    /// Register a mount.
    pub fn mount(&self, mount: Mount) -> StorageResult<Arc<Mount>> {
        self.registry.register(mount)
    }

    /// Build a backend through the driver registry and mount it.
    pub fn mount_config(&self, config: &MountConfig) -> StorageResult<Arc<Mount>> {
        let backend = self.drivers.build(&config.driver, &config.options)?;
        let mount = Mount::new(config.id.as_str(), &config.path, backend)
            .with_order(config.order)
            .with_no_cache(config.no_cache)
            .with_only_proxy(config.only_proxy);
        self.registry.register(mount)
    }

    /// Unregister a mount and evict everything cached for it.
    pub fn unmount(&self, id: &MountId) -> StorageResult<Arc<Mount>> {
        let mount = self.registry.unregister(id)?;
        self.ops.evict_mount(id);
        Ok(mount)
    }

    /// Replace a mount's configuration: unmount, then mount again.
    pub fn remount(&self, config: &MountConfig) -> StorageResult<Arc<Mount>> {
        let id = MountId::new(config.id.as_str());
        if self.registry.get(&id).is_some() {
            self.unmount(&id)?;
        }
        self.mount_config(config)
    }

    // ========================================================================
    // Signing
    // ========================================================================

    /// Sign a virtual path for sharing, with the configured expiration.
    pub fn sign_path(&self, path: &str) -> Result<String, SignError> {
        self.signer.sign(&crate::path::normalize(path))
    }

    /// Switch to a new signing secret. Previously issued tokens stop
    /// verifying.
    pub fn rekey(&self, secret: &str) {
        self.signer.replace(Arc::new(KeyedSigner::new(secret)));
        info!("signing key replaced");
    }

    /// Check a token produced by [`sign_path`](Self::sign_path).
    pub fn verify_path(&self, path: &str, token: &str) -> Result<(), SignError> {
        self.signer.verify(&crate::path::normalize(path), token)
    }
}
