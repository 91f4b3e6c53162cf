//! Core storage types.
//!
//! Objects and links are what backends report; they are cached and shared
//! between callers, so they are cheap to clone and never mutated in place.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncRead;

/// One file or directory as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    /// Entry name (not full path).
    pub name: String,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
    /// Directory flag.
    pub is_dir: bool,
    /// Backend-opaque identity (file id, inode, ...). May be empty.
    #[serde(default)]
    pub id: String,
    /// Direct URL, when the backend hands one out with the listing.
    #[serde(default)]
    pub url: Option<String>,
}

impl Object {
    /// Create a file object.
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            modified: SystemTime::now(),
            is_dir: false,
            id: String::new(),
            url: None,
        }
    }

    /// Create a directory object.
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            modified: SystemTime::now(),
            is_dir: true,
            id: String::new(),
            url: None,
        }
    }

    /// Set the backend id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the modification time.
    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified = modified;
        self
    }
}

/// A content link handed out by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Where the content can be fetched.
    pub url: String,
    /// How long the link stays valid. `None` means the backend gave no
    /// guarantee, and the link must not be reused.
    pub expiry: Option<Duration>,
}

impl Link {
    /// A link with no expiry.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expiry: None,
        }
    }

    /// A link valid for `expiry`.
    pub fn expiring(url: impl Into<String>, expiry: Duration) -> Self {
        Self {
            url: url.into(),
            expiry: Some(expiry),
        }
    }
}

/// Arguments for link generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkArgs {
    /// Client address, for backends that bind links to the requester.
    pub client_ip: Option<String>,
}

/// Static description of a driver: its name and capability flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Driver name (e.g. "local", "memory", "onedrive").
    pub name: String,
    /// Listings must never be cached.
    #[serde(default)]
    pub no_cache: bool,
    /// Content must be proxied rather than redirected to.
    #[serde(default)]
    pub only_proxy: bool,
    /// Backend does not accept uploads.
    #[serde(default)]
    pub no_upload: bool,
}

impl DriverConfig {
    /// Create a driver config with all flags off.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Upload progress callback, receives a percentage in `0.0..=100.0`.
pub type Progress = dyn Fn(f64) + Send + Sync;

/// Readable byte stream.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Readable content plus the metadata a backend needs to store it.
pub struct FileStream {
    /// Target file name.
    pub name: String,
    /// Total size in bytes.
    pub size: u64,
    /// MIME type.
    pub mime: String,
    /// Content.
    pub reader: ByteStream,
}

impl FileStream {
    /// Wrap a reader.
    pub fn new(name: impl Into<String>, size: u64, reader: ByteStream) -> Self {
        let name = name.into();
        let mime = guess_mime(&name).to_string();
        Self {
            name,
            size,
            mime,
            reader,
        }
    }

    /// Stream an in-memory buffer.
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self::new(name, size, Box::pin(std::io::Cursor::new(data)))
    }

    /// Replace the reader, keeping the metadata.
    pub fn map_reader(self, f: impl FnOnce(ByteStream) -> ByteStream) -> Self {
        Self {
            reader: f(self.reader),
            ..self
        }
    }
}

impl fmt::Debug for FileStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStream")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("mime", &self.mime)
            .finish_non_exhaustive()
    }
}

/// Guess a MIME type from the file extension.
fn guess_mime(name: &str) -> &'static str {
    let Some((_, ext)) = name.rsplit_once('.') else {
        return "application/octet-stream";
    };
    match ext.to_ascii_lowercase().as_str() {
        "txt" | "md" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_object_constructors() {
        let f = Object::file("a.txt", 12).with_id("42");
        assert!(!f.is_dir);
        assert_eq!(f.size, 12);
        assert_eq!(f.id, "42");

        let d = Object::dir("photos");
        assert!(d.is_dir);
        assert_eq!(d.size, 0);
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime("notes.TXT"), "text/plain");
        assert_eq!(guess_mime("movie.mkv"), "video/x-matroska");
        assert_eq!(guess_mime("noext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_file_stream_from_bytes() {
        let mut stream = FileStream::from_bytes("hello.txt", b"hello".to_vec());
        assert_eq!(stream.size, 5);
        assert_eq!(stream.mime, "text/plain");

        let mut buf = Vec::new();
        stream.reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }
}
