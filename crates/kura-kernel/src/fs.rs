//! Virtual-path facade.
//!
//! Callers address everything by virtual path. `Fs` resolves the owning
//! mount, calls the operations layer with the backend path, and fills in
//! virtual directories: paths with no owning mount but with mounts beneath
//! them. Virtual directories can be listed and stat'ed but never written.
//!
//! Every failed operation is logged here, once, before being returned.

use std::fmt::Display;
use std::sync::Arc;
use tracing::error;

use crate::context::OpContext;
use crate::copy::{CopyJob, CopyOrchestrator};
use crate::error::{StorageError, StorageResult};
use crate::ids::TaskId;
use crate::mount::{Mount, MountRegistry, Resolved};
use crate::ops::Ops;
use crate::path;
use crate::types::{FileStream, Link, LinkArgs, Object, Progress};

/// How a copy was carried out.
#[derive(Debug)]
pub enum CopyOutcome {
    /// Source and destination share a mount; the backend copied directly.
    Done,
    /// Cross-mount copy running as tasks.
    Started(CopyJob),
}

fn logged<T>(result: StorageResult<T>, op: &str, target: impl Display) -> StorageResult<T> {
    if let Err(e) = &result {
        error!(error = %e, "failed {op} {target}");
    }
    result
}

/// The unified filesystem.
pub struct Fs {
    registry: Arc<MountRegistry>,
    ops: Arc<Ops>,
    copier: CopyOrchestrator,
}

impl Fs {
    pub fn new(registry: Arc<MountRegistry>, ops: Arc<Ops>, copier: CopyOrchestrator) -> Self {
        Self {
            registry,
            ops,
            copier,
        }
    }

    pub fn registry(&self) -> &Arc<MountRegistry> {
        &self.registry
    }

    pub fn ops(&self) -> &Arc<Ops> {
        &self.ops
    }

    /// Resolve a path that is about to be written.
    fn resolve_writable(&self, p: &str) -> StorageResult<Resolved> {
        self.resolve_writable_near(p, None)
    }

    /// Resolve a write target, staying on `near` when it shares a group with
    /// the path.
    fn resolve_writable_near(&self, p: &str, near: Option<&Arc<Mount>>) -> StorageResult<Resolved> {
        let resolved = match near {
            Some(m) => self.registry.resolve_near(p, m),
            None => self.registry.resolve(p),
        };
        match resolved {
            Ok(r) => Ok(r),
            Err(_) if self.registry.is_virtual_dir(p) => Err(StorageError::not_supported(
                format!("virtual directory is read-only: {}", path::normalize(p)),
            )),
            Err(e) => Err(e),
        }
    }

    /// Resolve a path whose mount root must not be touched.
    fn resolve_entry(&self, p: &str) -> StorageResult<Resolved> {
        let r = self.resolve_writable(p)?;
        if r.path == "/" {
            return Err(StorageError::not_supported(format!(
                "cannot modify mount point {}",
                path::normalize(p)
            )));
        }
        Ok(r)
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// List a directory.
    pub async fn list(&self, cx: &OpContext, p: &str) -> StorageResult<Vec<Object>> {
        self.list_with(cx, p, false).await
    }

    /// List a directory, optionally dropping the cached listing first.
    pub async fn list_with(
        &self,
        cx: &OpContext,
        p: &str,
        refresh: bool,
    ) -> StorageResult<Vec<Object>> {
        logged(self.list_inner(cx, p, refresh).await, "list", p)
    }

    async fn list_inner(&self, cx: &OpContext, p: &str, refresh: bool) -> StorageResult<Vec<Object>> {
        let virtual_names = self.registry.child_names(p);
        let mut objs: Vec<Object> = match self.registry.resolve(p) {
            Ok(r) => match self.ops.list(cx, &r.mount, &r.path, refresh).await {
                Ok(listing) => listing.to_vec(),
                Err(StorageError::NotFound(_)) if !virtual_names.is_empty() => Vec::new(),
                Err(e) => return Err(e),
            },
            Err(_) if !virtual_names.is_empty() => Vec::new(),
            Err(e) => return Err(e),
        };

        for name in virtual_names {
            if !objs.iter().any(|o| o.name == name) {
                objs.push(Object::dir(name));
            }
        }
        Ok(objs)
    }

    /// Stat a path.
    pub async fn get(&self, cx: &OpContext, p: &str) -> StorageResult<Object> {
        logged(self.get_inner(cx, p).await, "get", p)
    }

    async fn get_inner(&self, cx: &OpContext, p: &str) -> StorageResult<Object> {
        let normalized = path::normalize(p);
        let name = match path::base_name(&normalized) {
            n if n.is_empty() => "root".to_string(),
            n => n,
        };
        let is_virtual = self.registry.is_virtual_dir(&normalized);
        if is_virtual {
            return Ok(Object::dir(name));
        }

        let r = self.registry.resolve(&normalized)?;
        match self.ops.get(cx, &r.mount, &r.path).await {
            Ok(mut obj) => {
                // A mount's root carries the mount point's name.
                if r.path == "/" {
                    obj.name = name;
                }
                Ok(obj)
            }
            Err(StorageError::NotFound(_)) if !self.registry.child_names(&normalized).is_empty() => {
                Ok(Object::dir(name))
            }
            Err(e) => Err(e),
        }
    }

    /// Get a content link for a file, together with the file's metadata.
    pub async fn link(
        &self,
        cx: &OpContext,
        p: &str,
        args: &LinkArgs,
    ) -> StorageResult<(Link, Object)> {
        logged(self.link_inner(cx, p, args).await, "link", p)
    }

    async fn link_inner(
        &self,
        cx: &OpContext,
        p: &str,
        args: &LinkArgs,
    ) -> StorageResult<(Link, Object)> {
        let r = self.registry.resolve(p)?;
        let obj = self.ops.get(cx, &r.mount, &r.path).await?;
        if obj.is_dir {
            return Err(StorageError::not_supported(format!(
                "cannot link a directory: {}",
                path::normalize(p)
            )));
        }
        let link = self.ops.link(cx, &r.mount, &r.path, args).await?;
        Ok((link, obj))
    }

    // ========================================================================
    // Writing
    // ========================================================================

    pub async fn make_dir(&self, cx: &OpContext, p: &str) -> StorageResult<()> {
        let result = async {
            let r = self.resolve_writable(p)?;
            self.ops.make_dir(cx, &r.mount, &r.path).await
        }
        .await;
        logged(result, "make dir", p)
    }

    /// Move `src` into the directory `dst_dir`. Both must be on one mount.
    pub async fn move_to(&self, cx: &OpContext, src: &str, dst_dir: &str) -> StorageResult<()> {
        let result = async {
            let s = self.resolve_entry(src)?;
            let d = self.resolve_writable_near(dst_dir, Some(&s.mount))?;
            if s.mount.id() != d.mount.id() {
                return Err(StorageError::not_supported("cannot move across mounts"));
            }
            self.ops.move_to(cx, &s.mount, &s.path, &d.path).await
        }
        .await;
        logged(result, "move", format_args!("{src} to {dst_dir}"))
    }

    pub async fn rename(&self, cx: &OpContext, src: &str, new_name: &str) -> StorageResult<()> {
        let result = async {
            if new_name.is_empty() || new_name.contains('/') {
                return Err(StorageError::invalid_path(new_name));
            }
            let r = self.resolve_entry(src)?;
            self.ops.rename(cx, &r.mount, &r.path, new_name).await
        }
        .await;
        logged(result, "rename", format_args!("{src} to {new_name}"))
    }

    /// Copy `src` into the directory `dst_dir`.
    ///
    /// Within one mount this is the backend's own copy and completes before
    /// returning. Across mounts it starts a [`CopyJob`].
    pub async fn copy(&self, cx: &OpContext, src: &str, dst_dir: &str) -> StorageResult<CopyOutcome> {
        let result = async {
            let s = self.registry.resolve(src)?;
            let d = self.resolve_writable_near(dst_dir, Some(&s.mount))?;
            if s.mount.id() == d.mount.id() {
                self.ops.copy_to(cx, &s.mount, &s.path, &d.path).await?;
                return Ok(CopyOutcome::Done);
            }
            let job = self
                .copier
                .copy_between_mounts(cx, s.mount, &s.path, d.mount, &d.path)
                .await?;
            Ok(CopyOutcome::Started(job))
        }
        .await;
        logged(result, "copy", format_args!("{src} to {dst_dir}"))
    }

    pub async fn remove(&self, cx: &OpContext, p: &str) -> StorageResult<()> {
        let result = async {
            let r = self.resolve_entry(p)?;
            self.ops.remove(cx, &r.mount, &r.path).await
        }
        .await;
        logged(result, "remove", p)
    }

    /// Upload into `dst_dir` and wait for it.
    pub async fn put(
        &self,
        cx: &OpContext,
        dst_dir: &str,
        stream: FileStream,
        progress: &Progress,
    ) -> StorageResult<()> {
        let result = async {
            let r = self.resolve_writable(dst_dir)?;
            self.ops.put(cx, &r.mount, &r.path, stream, progress).await
        }
        .await;
        logged(result, "put", dst_dir)
    }

    /// Upload into `dst_dir` as a background task.
    pub fn put_as_task(&self, dst_dir: &str, stream: FileStream) -> StorageResult<TaskId> {
        let result = self
            .resolve_writable(dst_dir)
            .map(|r| self.copier.put_as_task(r.mount, &r.path, stream));
        logged(result, "put", dst_dir)
    }
}
