//! In-memory storage backend.
//!
//! Used for scratch mounts and testing. All data is ephemeral.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::backend::StorageBackend;
use crate::context::OpContext;
use crate::error::{StorageError, StorageResult};
use crate::path;
use crate::types::{ByteStream, DriverConfig, FileStream, Link, LinkArgs, Object, Progress};

/// Upload read size; cancellation is checked once per chunk.
const CHUNK_SIZE: usize = 64 * 1024;

/// Entry in the memory store.
#[derive(Debug, Clone)]
enum Entry {
    File {
        data: Arc<Vec<u8>>,
        modified: SystemTime,
    },
    Directory {
        modified: SystemTime,
    },
}

impl Entry {
    fn to_object(&self, name: &str) -> Object {
        match self {
            Entry::File { data, modified } => {
                Object::file(name, data.len() as u64).with_modified(*modified)
            }
            Entry::Directory { modified } => Object::dir(name).with_modified(*modified),
        }
    }
}

/// In-memory storage backend.
///
/// Thread-safe via internal `RwLock`. All data is lost when dropped.
#[derive(Debug)]
pub struct MemoryBackend {
    /// Distinguishes this instance's links from another's.
    instance: Uuid,
    entries: RwLock<HashMap<String, Entry>>,
    link_expiry: Option<Duration>,
    no_cache: bool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        // Root directory always exists
        entries.insert(
            "/".to_string(),
            Entry::Directory {
                modified: SystemTime::now(),
            },
        );
        Self {
            instance: Uuid::new_v4(),
            entries: RwLock::new(entries),
            link_expiry: None,
            no_cache: false,
        }
    }

    /// Hand out links valid for `expiry` instead of non-expiring ones.
    pub fn with_link_expiry(mut self, expiry: Duration) -> Self {
        self.link_expiry = Some(expiry);
        self
    }

    /// Report `no_cache` in the driver config.
    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    /// Seed a file, creating parent directories.
    pub fn write_file(&self, path: &str, data: impl Into<Vec<u8>>) -> StorageResult<()> {
        let path = path::normalize(path);
        let mut entries = self.write_lock()?;
        Self::ensure_dirs(&mut entries, &path::parent(&path))?;
        entries.insert(
            path,
            Entry::File {
                data: Arc::new(data.into()),
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    /// Read a file's full contents, if it exists.
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        let path = path::normalize(path);
        let entries = self.entries.read().ok()?;
        match entries.get(&path) {
            Some(Entry::File { data, .. }) => Some(data.as_ref().clone()),
            _ => None,
        }
    }

    fn write_lock(
        &self,
    ) -> StorageResult<std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .write()
            .map_err(|_| StorageError::other("lock poisoned"))
    }

    fn read_lock(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .read()
            .map_err(|_| StorageError::other("lock poisoned"))
    }

    /// Create `dir` and all its ancestors.
    fn ensure_dirs(entries: &mut HashMap<String, Entry>, dir: &str) -> StorageResult<()> {
        let mut current = String::new();
        for seg in dir.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(seg);
            match entries.get(&current) {
                Some(Entry::Directory { .. }) => {}
                Some(Entry::File { .. }) => return Err(StorageError::not_a_folder(current)),
                None => {
                    entries.insert(
                        current.clone(),
                        Entry::Directory {
                            modified: SystemTime::now(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn require_dir(entries: &HashMap<String, Entry>, dir: &str) -> StorageResult<()> {
        match entries.get(dir) {
            Some(Entry::Directory { .. }) => Ok(()),
            Some(Entry::File { .. }) => Err(StorageError::not_a_folder(dir)),
            None => Err(StorageError::not_found(dir)),
        }
    }

    /// `path` itself plus every entry beneath it.
    fn subtree(entries: &HashMap<String, Entry>, root: &str) -> Vec<String> {
        entries
            .keys()
            .filter(|k| path::strip_prefix(k, root).is_some())
            .cloned()
            .collect()
    }

    /// Copy or move the subtree at `src` so that it lands at `dst`.
    fn transplant(
        entries: &mut HashMap<String, Entry>,
        src: &str,
        dst: &str,
        keep_source: bool,
    ) -> StorageResult<()> {
        if src == "/" {
            return Err(StorageError::not_supported("cannot move the root"));
        }
        if !entries.contains_key(src) {
            return Err(StorageError::not_found(src));
        }
        if path::strip_prefix(dst, src).is_some() {
            return Err(StorageError::invalid_path(format!(
                "{dst} is inside {src}"
            )));
        }
        if entries.contains_key(dst) {
            return Err(StorageError::already_exists(dst));
        }
        for key in Self::subtree(entries, src) {
            let rest = path::strip_prefix(&key, src).unwrap_or_else(|| "/".to_string());
            let target = path::normalize(&format!("{dst}{rest}"));
            let entry = if keep_source {
                entries.get(&key).cloned()
            } else {
                entries.remove(&key)
            };
            if let Some(entry) = entry {
                entries.insert(target, entry);
            }
        }
        Ok(())
    }

    fn link_url(&self, path: &str) -> String {
        format!("memory://{}{}", self.instance, path)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn config(&self) -> DriverConfig {
        DriverConfig {
            no_cache: self.no_cache,
            ..DriverConfig::new("memory")
        }
    }

    async fn list(&self, cx: &OpContext, path: &str) -> StorageResult<Vec<Object>> {
        cx.check()?;
        let dir = path::normalize(path);
        let entries = self.read_lock()?;
        Self::require_dir(&entries, &dir)?;

        let mut result: Vec<Object> = entries
            .iter()
            .filter(|(k, _)| k.as_str() != "/" && path::parent(k) == dir)
            .map(|(k, e)| e.to_object(&path::base_name(k)))
            .collect();

        // Sort for consistent ordering
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn get(&self, cx: &OpContext, path: &str) -> StorageResult<Object> {
        cx.check()?;
        let path = path::normalize(path);
        let entries = self.read_lock()?;
        entries
            .get(&path)
            .map(|e| e.to_object(&path::base_name(&path)))
            .ok_or_else(|| StorageError::not_found(path))
    }

    async fn link(&self, cx: &OpContext, path: &str, _args: &LinkArgs) -> StorageResult<Link> {
        cx.check()?;
        let path = path::normalize(path);
        let entries = self.read_lock()?;
        match entries.get(&path) {
            Some(Entry::File { .. }) => Ok(Link {
                url: self.link_url(&path),
                expiry: self.link_expiry,
            }),
            Some(Entry::Directory { .. }) => Err(StorageError::not_supported(format!(
                "cannot link a directory: {path}"
            ))),
            None => Err(StorageError::not_found(path)),
        }
    }

    async fn open_link(&self, cx: &OpContext, link: &Link) -> StorageResult<ByteStream> {
        cx.check()?;
        let prefix = format!("memory://{}", self.instance);
        let path = link
            .url
            .strip_prefix(&prefix)
            .ok_or_else(|| StorageError::not_supported(format!("foreign link: {}", link.url)))?;
        let entries = self.read_lock()?;
        match entries.get(path) {
            Some(Entry::File { data, .. }) => {
                Ok(Box::pin(std::io::Cursor::new(data.as_ref().clone())))
            }
            Some(Entry::Directory { .. }) => Err(StorageError::not_supported(path)),
            None => Err(StorageError::not_found(path)),
        }
    }

    async fn make_dir(&self, cx: &OpContext, path: &str) -> StorageResult<()> {
        cx.check()?;
        let path = path::normalize(path);
        let mut entries = self.write_lock()?;
        Self::ensure_dirs(&mut entries, &path)
    }

    async fn move_to(&self, cx: &OpContext, src: &str, dst_dir: &str) -> StorageResult<()> {
        cx.check()?;
        let src = path::normalize(src);
        let dst_dir = path::normalize(dst_dir);
        let mut entries = self.write_lock()?;
        Self::require_dir(&entries, &dst_dir)?;
        let dst = path::join(&dst_dir, &path::base_name(&src));
        Self::transplant(&mut entries, &src, &dst, false)
    }

    async fn rename(&self, cx: &OpContext, src: &str, new_name: &str) -> StorageResult<()> {
        cx.check()?;
        if new_name.is_empty() || new_name.contains('/') {
            return Err(StorageError::invalid_path(new_name));
        }
        let src = path::normalize(src);
        let dst = path::join(&path::parent(&src), new_name);
        let mut entries = self.write_lock()?;
        Self::transplant(&mut entries, &src, &dst, false)
    }

    async fn copy_to(&self, cx: &OpContext, src: &str, dst_dir: &str) -> StorageResult<()> {
        cx.check()?;
        let src = path::normalize(src);
        let dst_dir = path::normalize(dst_dir);
        let mut entries = self.write_lock()?;
        Self::require_dir(&entries, &dst_dir)?;
        let dst = path::join(&dst_dir, &path::base_name(&src));
        Self::transplant(&mut entries, &src, &dst, true)
    }

    async fn remove(&self, cx: &OpContext, path: &str) -> StorageResult<()> {
        cx.check()?;
        let path = path::normalize(path);
        if path == "/" {
            return Err(StorageError::not_supported("cannot remove root"));
        }
        let mut entries = self.write_lock()?;
        if !entries.contains_key(&path) {
            return Err(StorageError::not_found(path));
        }
        for key in Self::subtree(&entries, &path) {
            entries.remove(&key);
        }
        Ok(())
    }

    async fn put(
        &self,
        cx: &OpContext,
        dst_dir: &str,
        mut stream: FileStream,
        progress: &Progress,
    ) -> StorageResult<()> {
        let dst_dir = path::normalize(dst_dir);
        {
            let entries = self.read_lock()?;
            Self::require_dir(&entries, &dst_dir)?;
        }

        let mut data = Vec::with_capacity(stream.size as usize);
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            cx.check()?;
            let n = stream.reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            if stream.size > 0 {
                progress(data.len() as f64 * 100.0 / stream.size as f64);
            }
        }
        progress(100.0);

        let target = path::join(&dst_dir, &stream.name);
        let mut entries = self.write_lock()?;
        if let Some(Entry::Directory { .. }) = entries.get(&target) {
            return Err(StorageError::already_exists(target));
        }
        entries.insert(
            target,
            Entry::File {
                data: Arc::new(data),
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }
}
