//! Storage backend trait.
//!
//! Every registered storage instance (cloud drive, local disk, media
//! service, ...) implements [`StorageBackend`]. Paths are always relative to
//! the backend's root and start with `/`; the mount registry handles routing
//! and path translation.
//!
//! Capabilities a backend may or may not have are modeled as optional
//! extension traits, discovered through the `as_*` accessors rather than by
//! downcasting to a concrete driver type.

use async_trait::async_trait;

use crate::context::OpContext;
use crate::error::{StorageError, StorageResult};
use crate::types::{ByteStream, DriverConfig, FileStream, Link, LinkArgs, Object, Progress};

/// Core storage operations.
///
/// Mutations default to `NotImplemented` so read-only drivers only provide
/// the reading half. Adapters report domain errors (`NotFound`,
/// `NotSupported`, `NotAFolder`, `CredentialInvalid`) instead of their
/// transport's errors.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Driver name and capability flags.
    fn config(&self) -> DriverConfig;

    // ========================================================================
    // Reading
    // ========================================================================

    /// List a directory. Order is the backend's.
    async fn list(&self, cx: &OpContext, path: &str) -> StorageResult<Vec<Object>>;

    /// Stat a single object.
    ///
    /// The operations layer normally answers this from the parent listing;
    /// this is the fallback for backends that cannot list the parent.
    async fn get(&self, _cx: &OpContext, path: &str) -> StorageResult<Object> {
        Err(StorageError::not_implemented(format!("get {path}")))
    }

    /// Produce a content link for a file.
    async fn link(&self, cx: &OpContext, path: &str, args: &LinkArgs) -> StorageResult<Link>;

    /// Open a readable stream for a link this backend produced.
    async fn open_link(&self, _cx: &OpContext, link: &Link) -> StorageResult<ByteStream> {
        Err(StorageError::not_implemented(format!("open {}", link.url)))
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Create a directory (and any missing parents). Existing is not an error.
    async fn make_dir(&self, _cx: &OpContext, path: &str) -> StorageResult<()> {
        Err(StorageError::not_implemented(format!("make_dir {path}")))
    }

    /// Move `src` into the directory `dst_dir`.
    async fn move_to(&self, _cx: &OpContext, src: &str, _dst_dir: &str) -> StorageResult<()> {
        Err(StorageError::not_implemented(format!("move {src}")))
    }

    /// Rename `src` in place.
    async fn rename(&self, _cx: &OpContext, src: &str, _new_name: &str) -> StorageResult<()> {
        Err(StorageError::not_implemented(format!("rename {src}")))
    }

    /// Server-side copy of `src` into the directory `dst_dir`.
    async fn copy_to(&self, _cx: &OpContext, src: &str, _dst_dir: &str) -> StorageResult<()> {
        Err(StorageError::not_implemented(format!("copy {src}")))
    }

    /// Remove a file or directory tree.
    async fn remove(&self, _cx: &OpContext, path: &str) -> StorageResult<()> {
        Err(StorageError::not_implemented(format!("remove {path}")))
    }

    /// Store `stream` as `dst_dir/<stream.name>`, reporting upload progress.
    async fn put(
        &self,
        _cx: &OpContext,
        dst_dir: &str,
        stream: FileStream,
        _progress: &Progress,
    ) -> StorageResult<()> {
        Err(StorageError::not_implemented(format!(
            "put {}/{}",
            dst_dir, stream.name
        )))
    }

    // ========================================================================
    // Optional capabilities
    // ========================================================================

    /// Backend identifies its root folder by id.
    fn as_root_folder_id(&self) -> Option<&dyn RootFolderId> {
        None
    }

    /// Backend is rooted at a configured folder path.
    fn as_root_folder_path(&self) -> Option<&dyn RootFolderPath> {
        None
    }
}

/// Backend whose root folder has a backend-side identity.
pub trait RootFolderId: Send + Sync {
    fn root_folder_id(&self) -> &str;
}

/// Backend whose root is a configured folder path.
pub trait RootFolderPath: Send + Sync {
    fn root_folder_path(&self) -> &str;
}
