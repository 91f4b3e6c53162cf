//! Operations on a resolved mount.
//!
//! Everything here takes a [`Mount`] and a path inside its backend. Listings
//! and links go through coalescing caches; mutations invalidate the listings
//! they make stale. Paths are normalized on entry.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::CoalescingCache;
use crate::context::OpContext;
use crate::error::{StorageError, StorageResult};
use crate::mount::{Mount, MountId};
use crate::path;
use crate::search::SearchSlot;
use crate::types::{FileStream, Link, LinkArgs, Object, Progress};

/// Default lifetime of a cached listing.
pub const DEFAULT_LIST_TTL: Duration = Duration::from_secs(30 * 60);

/// Cache key: owning mount plus normalized backend path.
pub type CacheKey = (MountId, String);

/// An immutable listing snapshot, shared by every reader.
pub type Listing = Arc<[Object]>;

/// Per-mount operations with caching.
pub struct Ops {
    lists: CoalescingCache<CacheKey, Listing>,
    links: CoalescingCache<CacheKey, Link>,
    list_ttl: Duration,
    search: Arc<SearchSlot>,
}

impl Ops {
    pub fn new(list_ttl: Duration, search: Arc<SearchSlot>) -> Self {
        Self {
            lists: CoalescingCache::new(),
            links: CoalescingCache::new(),
            list_ttl,
            search,
        }
    }

    fn key(mount: &Mount, path: &str) -> CacheKey {
        (mount.id().clone(), path.to_string())
    }

    /// The virtual path of a backend path inside `mount`.
    pub fn virtual_path(mount: &Mount, path: &str) -> String {
        path::join(mount.group_path(), path)
    }

    /// The listing cache, for inspection.
    pub fn list_cache(&self) -> &CoalescingCache<CacheKey, Listing> {
        &self.lists
    }

    /// The link cache, for inspection.
    pub fn link_cache(&self) -> &CoalescingCache<CacheKey, Link> {
        &self.links
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// List a directory, through the cache unless the mount opts out.
    ///
    /// `refresh` drops the cached listing first.
    pub async fn list(
        &self,
        cx: &OpContext,
        mount: &Mount,
        path: &str,
        refresh: bool,
    ) -> StorageResult<Listing> {
        let path = path::normalize(path);
        let parent = Self::virtual_path(mount, &path);

        if mount.no_cache() {
            let objs: Listing = cx
                .run(mount.backend().list(cx, &path))
                .await
                .map_err(|e| e.context(format!("failed to list {path}")))?
                .into();
            if self.search.auto_update() {
                self.search.index_listing(cx, &parent, &objs).await;
            }
            return Ok(objs);
        }

        let key = Self::key(mount, &path);
        if refresh {
            self.lists.invalidate(&key);
        }

        let backend = Arc::clone(mount.backend());
        let search = Arc::clone(&self.search);
        let fetch_cx = cx.detached();
        let fetch_path = path.clone();
        let ttl = self.list_ttl;
        let fetch = move || async move {
            debug!(path = %fetch_path, "listing from backend");
            let objs: Listing = backend.list(&fetch_cx, &fetch_path).await?.into();
            if search.auto_update() {
                search.index_listing(&fetch_cx, &parent, &objs).await;
            }
            Ok(objs)
        };

        cx.run(self.lists.get_or_fetch(key, move |_| Some(ttl), fetch))
            .await
            .map_err(|e| e.context(format!("failed to list {path}")))
    }

    /// Stat one object.
    ///
    /// The root is synthesized. Anything else is looked up in its parent's
    /// listing, falling back to the backend's own `get` when the parent
    /// cannot be listed.
    pub async fn get(&self, cx: &OpContext, mount: &Mount, path: &str) -> StorageResult<Object> {
        let path = path::normalize(path);
        let backend = mount.backend();

        if path == "/" {
            let root = Object::dir("root");
            if let Some(r) = backend.as_root_folder_id() {
                return Ok(root.with_id(r.root_folder_id()));
            }
            if let Some(r) = backend.as_root_folder_path() {
                debug!(root = r.root_folder_path(), "synthesized root object");
            }
            return Ok(root);
        }

        let (parent, name) = path::split(&path);
        match self.list(cx, mount, &parent, false).await {
            Ok(objs) => objs
                .iter()
                .find(|o| o.name == name)
                .cloned()
                .ok_or_else(|| StorageError::not_found(path.clone())),
            Err(StorageError::NotFound(_) | StorageError::NotImplemented(_)) => cx
                .run(backend.get(cx, &path))
                .await
                .map_err(|e| e.context(format!("failed to get {path}"))),
            Err(e) => Err(e.context("failed to get parent listing")),
        }
    }

    /// Get a content link, cached for the link's own expiry.
    pub async fn link(
        &self,
        cx: &OpContext,
        mount: &Mount,
        path: &str,
        args: &LinkArgs,
    ) -> StorageResult<Link> {
        let path = path::normalize(path);
        if mount.no_cache() {
            return cx
                .run(mount.backend().link(cx, &path, args))
                .await
                .map_err(|e| e.context(format!("failed to link {path}")));
        }

        let backend = Arc::clone(mount.backend());
        let fetch_cx = cx.detached();
        let fetch_path = path.clone();
        let args = args.clone();
        let fetch =
            move || async move { backend.link(&fetch_cx, &fetch_path, &args).await };

        cx.run(
            self.links
                .get_or_fetch(Self::key(mount, &path), |link: &Link| link.expiry, fetch),
        )
        .await
        .map_err(|e| e.context(format!("failed to link {path}")))
    }

    // ========================================================================
    // Writing
    // ========================================================================

    pub async fn make_dir(&self, cx: &OpContext, mount: &Mount, path: &str) -> StorageResult<()> {
        let path = path::normalize(path);
        cx.run(mount.backend().make_dir(cx, &path))
            .await
            .map_err(|e| e.context(format!("failed to make dir {path}")))?;

        let (parent, name) = path::split(&path);
        self.invalidate(mount, &parent);
        self.search
            .index(cx, &Self::virtual_path(mount, &parent), &Object::dir(name))
            .await;
        Ok(())
    }

    /// Move `src` into the directory `dst_dir` on the same mount.
    pub async fn move_to(
        &self,
        cx: &OpContext,
        mount: &Mount,
        src: &str,
        dst_dir: &str,
    ) -> StorageResult<()> {
        let (src, dst_dir) = (path::normalize(src), path::normalize(dst_dir));
        cx.run(mount.backend().move_to(cx, &src, &dst_dir))
            .await
            .map_err(|e| e.context(format!("failed to move {src} to {dst_dir}")))?;

        self.invalidate(mount, &path::parent(&src));
        self.invalidate(mount, &dst_dir);
        self.invalidate_tree(mount, &src);
        Ok(())
    }

    pub async fn rename(
        &self,
        cx: &OpContext,
        mount: &Mount,
        src: &str,
        new_name: &str,
    ) -> StorageResult<()> {
        let src = path::normalize(src);
        cx.run(mount.backend().rename(cx, &src, new_name))
            .await
            .map_err(|e| e.context(format!("failed to rename {src} to {new_name}")))?;

        self.invalidate(mount, &path::parent(&src));
        self.invalidate_tree(mount, &src);
        Ok(())
    }

    /// Backend-side copy of `src` into `dst_dir` on the same mount.
    pub async fn copy_to(
        &self,
        cx: &OpContext,
        mount: &Mount,
        src: &str,
        dst_dir: &str,
    ) -> StorageResult<()> {
        let (src, dst_dir) = (path::normalize(src), path::normalize(dst_dir));
        cx.run(mount.backend().copy_to(cx, &src, &dst_dir))
            .await
            .map_err(|e| e.context(format!("failed to copy {src} to {dst_dir}")))?;

        self.invalidate(mount, &path::parent(&src));
        self.invalidate(mount, &dst_dir);
        Ok(())
    }

    pub async fn remove(&self, cx: &OpContext, mount: &Mount, path: &str) -> StorageResult<()> {
        let path = path::normalize(path);
        cx.run(mount.backend().remove(cx, &path))
            .await
            .map_err(|e| e.context(format!("failed to remove {path}")))?;

        self.invalidate(mount, &path::parent(&path));
        self.invalidate_tree(mount, &path);
        Ok(())
    }

    /// Upload `stream` into `dst_dir`.
    pub async fn put(
        &self,
        cx: &OpContext,
        mount: &Mount,
        dst_dir: &str,
        stream: FileStream,
        progress: &Progress,
    ) -> StorageResult<()> {
        let dst_dir = path::normalize(dst_dir);
        let uploaded = Object::file(stream.name.clone(), stream.size);
        let result = mount.backend().put(cx, &dst_dir, stream, progress).await;

        // A failed upload may still have left a partial object behind.
        self.invalidate(mount, &dst_dir);
        result.map_err(|e| e.context(format!("failed to put {}/{}", dst_dir, uploaded.name)))?;

        self.search
            .index(cx, &Self::virtual_path(mount, &dst_dir), &uploaded)
            .await;
        Ok(())
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Drop the cached listing of one directory.
    pub fn invalidate(&self, mount: &Mount, dir: &str) {
        self.lists.invalidate(&Self::key(mount, &path::normalize(dir)));
    }

    /// Drop cached listings at and beneath `root`.
    fn invalidate_tree(&self, mount: &Mount, root: &str) {
        let id = mount.id();
        self.lists.invalidate_where(|(m, p)| {
            m == id && (p == root || path::is_strict_descendant(p, root))
        });
    }

    /// Evict every cached listing and link of a mount.
    pub fn evict_mount(&self, id: &MountId) {
        self.lists.invalidate_where(|(m, _)| m == id);
        self.links.invalidate_where(|(m, _)| m == id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::search::MemoryIndex;

    fn setup() -> (Ops, Arc<MemoryBackend>, Mount) {
        let backend = Arc::new(MemoryBackend::new());
        let mount = Mount::new("mem", "/m", backend.clone());
        (
            Ops::new(DEFAULT_LIST_TTL, Arc::new(SearchSlot::new())),
            backend,
            mount,
        )
    }

    #[tokio::test]
    async fn test_get_from_parent_listing() {
        let (ops, backend, mount) = setup();
        let cx = OpContext::background();
        backend.write_file("/docs/a.txt", b"abc").unwrap();

        let obj = ops.get(&cx, &mount, "/docs/a.txt").await.unwrap();
        assert_eq!(obj.size, 3);
        assert!(ops.list_cache().get(&("mem".into(), "/docs".into())).is_some());

        let err = ops.get(&cx, &mount, "/docs/missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_root_is_synthesized() {
        let (ops, _backend, mount) = setup();
        let root = ops.get(&OpContext::background(), &mount, "/").await.unwrap();
        assert!(root.is_dir);
        assert_eq!(root.name, "root");
    }

    #[tokio::test]
    async fn test_mutations_invalidate_parent() {
        let (ops, backend, mount) = setup();
        let cx = OpContext::background();
        backend.write_file("/d/one", b"1").unwrap();

        assert_eq!(ops.list(&cx, &mount, "/d", false).await.unwrap().len(), 1);
        ops.make_dir(&cx, &mount, "/d/sub").await.unwrap();
        assert_eq!(ops.list(&cx, &mount, "/d", false).await.unwrap().len(), 2);

        ops.put(
            &cx,
            &mount,
            "/d",
            FileStream::from_bytes("two", b"22".to_vec()),
            &|_: f64| {},
        )
        .await
        .unwrap();
        assert_eq!(ops.list(&cx, &mount, "/d", false).await.unwrap().len(), 3);

        ops.remove(&cx, &mount, "/d/one").await.unwrap();
        assert_eq!(ops.list(&cx, &mount, "/d", false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_no_cache_mount_never_stores() {
        let backend = Arc::new(MemoryBackend::new());
        let mount = Mount::new("raw", "/raw", backend.clone()).with_no_cache(true);
        let ops = Ops::new(DEFAULT_LIST_TTL, Arc::new(SearchSlot::new()));
        let cx = OpContext::background();
        backend.write_file("/f", b"x").unwrap();

        ops.list(&cx, &mount, "/", false).await.unwrap();
        ops.link(&cx, &mount, "/f", &LinkArgs::default()).await.unwrap();
        assert!(ops.list_cache().is_empty());
        assert!(ops.link_cache().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_listing_is_indexed() {
        let search = Arc::new(SearchSlot::new());
        let index = Arc::new(MemoryIndex::new());
        search.init(index.clone()).await;
        search.set_auto_update(true);

        let backend = Arc::new(MemoryBackend::new());
        backend.write_file("/music/song.flac", b"~~").unwrap();
        let mount = Mount::new("mem", "/lib", backend);
        let ops = Ops::new(DEFAULT_LIST_TTL, search);

        ops.list(&OpContext::background(), &mount, "/music", false)
            .await
            .unwrap();
        let hits = index.search("song");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].parent, "/lib/music");
    }

    #[tokio::test]
    async fn test_evict_mount() {
        let (ops, backend, mount) = setup();
        let cx = OpContext::background();
        backend.write_file("/f", b"x").unwrap();
        ops.list(&cx, &mount, "/", false).await.unwrap();
        assert_eq!(ops.list_cache().len(), 1);

        ops.evict_mount(mount.id());
        assert!(ops.list_cache().is_empty());
    }
}
