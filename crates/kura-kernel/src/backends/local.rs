//! Local filesystem backend.
//!
//! Provides access to a directory on the local disk, with path security
//! to prevent escaping the root directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::backend::{RootFolderPath, StorageBackend};
use crate::context::OpContext;
use crate::error::{StorageError, StorageResult};
use crate::path;
use crate::types::{ByteStream, DriverConfig, FileStream, Link, LinkArgs, Object, Progress};

const CHUNK_SIZE: usize = 64 * 1024;

/// Local filesystem backend.
///
/// All operations are relative to `root`. For example, if `root` is
/// `/srv/media`, then `list("/films")` lists `/srv/media/films`.
///
/// Path security is enforced: attempts to escape via `..` are blocked.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    root_str: String,
    read_only: bool,
}

impl LocalBackend {
    /// Create a new local backend rooted at the given path.
    ///
    /// The root is canonicalized at construction time to handle symlinks
    /// (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = root.canonicalize().unwrap_or(root);
        let root_str = root.display().to_string();
        Self {
            root,
            root_str,
            read_only: false,
        }
    }

    /// Create a read-only local backend.
    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            read_only: true,
            ..Self::new(root)
        }
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a backend path to an absolute path within the root.
    ///
    /// Virtual paths are normalized first, so `..` can never climb above the
    /// root; symlinks pointing outside are rejected after canonicalization.
    fn resolve(&self, p: &str) -> StorageResult<PathBuf> {
        let normalized = path::normalize(p);
        let rel = normalized.trim_start_matches('/');
        let full = if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        };

        if let Ok(canonical) = full.canonicalize() {
            if !canonical.starts_with(&self.root) {
                return Err(StorageError::invalid_path(format!(
                    "{} is not under {}",
                    canonical.display(),
                    self.root.display()
                )));
            }
        }
        Ok(full)
    }

    /// Check if write operations are allowed.
    fn check_writable(&self) -> StorageResult<()> {
        if self.read_only {
            Err(StorageError::not_supported("backend is read-only"))
        } else {
            Ok(())
        }
    }

    fn metadata_to_object(name: &str, meta: &std::fs::Metadata) -> Object {
        let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        if meta.is_dir() {
            Object::dir(name).with_modified(modified)
        } else {
            Object::file(name, meta.len()).with_modified(modified)
        }
    }

    /// Recursively copy a file or directory tree.
    async fn copy_tree(cx: &OpContext, from: PathBuf, to: PathBuf) -> StorageResult<()> {
        let mut stack = vec![(from, to)];
        while let Some((from, to)) = stack.pop() {
            cx.check()?;
            let meta = fs::metadata(&from).await?;
            if meta.is_dir() {
                fs::create_dir_all(&to).await?;
                let mut dir = fs::read_dir(&from).await?;
                while let Some(entry) = dir.next_entry().await? {
                    stack.push((entry.path(), to.join(entry.file_name())));
                }
            } else {
                fs::copy(&from, &to).await?;
            }
        }
        Ok(())
    }
}

impl RootFolderPath for LocalBackend {
    fn root_folder_path(&self) -> &str {
        &self.root_str
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn config(&self) -> DriverConfig {
        DriverConfig {
            no_cache: true,
            no_upload: self.read_only,
            ..DriverConfig::new("local")
        }
    }

    async fn list(&self, cx: &OpContext, p: &str) -> StorageResult<Vec<Object>> {
        cx.check()?;
        let full_path = self.resolve(p)?;
        let meta = fs::metadata(&full_path).await?;
        if !meta.is_dir() {
            return Err(StorageError::not_a_folder(p));
        }

        let mut objects = Vec::new();
        let mut dir = fs::read_dir(&full_path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            objects.push(Self::metadata_to_object(&name, &meta));
        }

        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn get(&self, cx: &OpContext, p: &str) -> StorageResult<Object> {
        cx.check()?;
        let full_path = self.resolve(p)?;
        let meta = fs::metadata(&full_path).await?;
        Ok(Self::metadata_to_object(&path::base_name(p), &meta))
    }

    async fn link(&self, cx: &OpContext, p: &str, _args: &LinkArgs) -> StorageResult<Link> {
        cx.check()?;
        let full_path = self.resolve(p)?;
        let meta = fs::metadata(&full_path).await?;
        if meta.is_dir() {
            return Err(StorageError::not_supported(format!(
                "cannot link a directory: {p}"
            )));
        }
        Ok(Link::new(format!("file://{}", full_path.display())))
    }

    async fn open_link(&self, cx: &OpContext, link: &Link) -> StorageResult<ByteStream> {
        cx.check()?;
        let raw = link
            .url
            .strip_prefix("file://")
            .ok_or_else(|| StorageError::not_supported(format!("foreign link: {}", link.url)))?;
        let full_path = PathBuf::from(raw).canonicalize()?;
        if !full_path.starts_with(&self.root) {
            return Err(StorageError::invalid_path(raw));
        }
        let file = fs::File::open(&full_path).await?;
        Ok(Box::pin(file))
    }

    async fn make_dir(&self, cx: &OpContext, p: &str) -> StorageResult<()> {
        cx.check()?;
        self.check_writable()?;
        let full_path = self.resolve(p)?;
        fs::create_dir_all(&full_path).await?;
        Ok(())
    }

    async fn move_to(&self, cx: &OpContext, src: &str, dst_dir: &str) -> StorageResult<()> {
        cx.check()?;
        self.check_writable()?;
        let from = self.resolve(src)?;
        let to = self.resolve(&path::join(dst_dir, &path::base_name(src)))?;
        fs::rename(&from, &to).await?;
        Ok(())
    }

    async fn rename(&self, cx: &OpContext, src: &str, new_name: &str) -> StorageResult<()> {
        cx.check()?;
        self.check_writable()?;
        if new_name.is_empty() || new_name.contains('/') {
            return Err(StorageError::invalid_path(new_name));
        }
        let from = self.resolve(src)?;
        let to = self.resolve(&path::join(&path::parent(src), new_name))?;
        fs::rename(&from, &to).await?;
        Ok(())
    }

    async fn copy_to(&self, cx: &OpContext, src: &str, dst_dir: &str) -> StorageResult<()> {
        self.check_writable()?;
        let from = self.resolve(src)?;
        let to = self.resolve(&path::join(dst_dir, &path::base_name(src)))?;
        if to.starts_with(&from) {
            return Err(StorageError::invalid_path(format!(
                "{dst_dir} is inside {src}"
            )));
        }
        Self::copy_tree(cx, from, to).await
    }

    async fn remove(&self, cx: &OpContext, p: &str) -> StorageResult<()> {
        cx.check()?;
        self.check_writable()?;
        if path::normalize(p) == "/" {
            return Err(StorageError::not_supported("cannot remove root"));
        }
        let full_path = self.resolve(p)?;
        let meta = fs::symlink_metadata(&full_path).await?;
        if meta.is_dir() {
            fs::remove_dir_all(&full_path).await?;
        } else {
            fs::remove_file(&full_path).await?;
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
        self.check_writable()?;
        let dir = self.resolve(dst_dir)?;
        let target = self.resolve(&path::join(dst_dir, &stream.name))?;
        if !fs::metadata(&dir).await?.is_dir() {
            return Err(StorageError::not_a_folder(dst_dir));
        }

        // Write next to the target and rename, so readers never see a partial file.
        let partial = dir.join(format!(".{}.part", stream.name));
        let mut file = fs::File::create(&partial).await?;
        let mut written: u64 = 0;
        let mut buf = vec![0u8; CHUNK_SIZE];

        let copied: StorageResult<()> = async {
            loop {
                cx.check()?;
                let n = stream.reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n]).await?;
                written += n as u64;
                if stream.size > 0 {
                    progress(written as f64 * 100.0 / stream.size as f64);
                }
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = copied {
            drop(file);
            let _ = fs::remove_file(&partial).await;
            return Err(e);
        }
        fs::rename(&partial, &target).await?;
        progress(100.0);
        Ok(())
    }

    fn as_root_folder_path(&self) -> Option<&dyn RootFolderPath> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalBackend) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        (dir, backend)
    }

    fn cx() -> OpContext {
        OpContext::background()
    }

    #[tokio::test]
    async fn test_list_and_get() {
        let (dir, fs) = setup();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let objects = fs.list(&cx(), "/").await.unwrap();
        let names: Vec<_> = objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub"]);
        assert_eq!(objects[0].size, 5);
        assert!(objects[1].is_dir);

        let obj = fs.get(&cx(), "/a.txt").await.unwrap();
        assert_eq!(obj.name, "a.txt");
    }

    #[tokio::test]
    async fn test_config_is_no_cache() {
        let (_dir, fs) = setup();
        assert!(fs.config().no_cache);
        assert!(fs.as_root_folder_path().is_some());
    }

    #[tokio::test]
    async fn test_put_and_open_link() {
        let (_dir, fs) = setup();
        fs.make_dir(&cx(), "/up").await.unwrap();
        fs.put(
            &cx(),
            "/up",
            FileStream::from_bytes("f.bin", vec![9u8; 1000]),
            &|_: f64| {},
        )
        .await
        .unwrap();

        let link = fs.link(&cx(), "/up/f.bin", &LinkArgs::default()).await.unwrap();
        assert!(link.expiry.is_none());
        let mut reader = fs.open_link(&cx(), &link).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf.len(), 1000);
    }

    #[tokio::test]
    async fn test_read_only() {
        let dir = TempDir::new().unwrap();
        let fs = LocalBackend::read_only(dir.path());
        let result = fs.make_dir(&cx(), "/x").await;
        assert!(matches!(result, Err(StorageError::NotSupported(_))));
    }

    #[tokio::test]
    async fn test_path_escape_blocked() {
        let (dir, fs) = setup();
        std::fs::write(dir.path().join("inside.txt"), b"x").unwrap();
        // `..` is normalized away, so this lands on the root's own file.
        let obj = fs.get(&cx(), "/../../inside.txt").await.unwrap();
        assert_eq!(obj.name, "inside.txt");

        let foreign = Link::new("file:///etc/passwd");
        assert!(fs.open_link(&cx(), &foreign).await.is_err());
    }

    #[tokio::test]
    async fn test_copy_move_remove() {
        let (dir, fs) = setup();
        std::fs::create_dir_all(dir.path().join("src/inner")).unwrap();
        std::fs::write(dir.path().join("src/inner/f.txt"), b"data").unwrap();
        std::fs::create_dir(dir.path().join("dst")).unwrap();

        fs.copy_to(&cx(), "/src", "/dst").await.unwrap();
        assert!(dir.path().join("dst/src/inner/f.txt").exists());

        fs.rename(&cx(), "/dst/src", "copy").await.unwrap();
        assert!(dir.path().join("dst/copy/inner/f.txt").exists());

        fs.move_to(&cx(), "/src", "/dst").await.unwrap();
        assert!(!dir.path().join("src").exists());

        fs.remove(&cx(), "/dst").await.unwrap();
        assert!(!dir.path().join("dst").exists());
    }
}
