//! captioned-storage: durable object storage and the upload transfer client.
//!
//! Objects are addressed by slash-separated keys (`images/IMG_0001.jpg`).
//! Two back ends are provided: a local directory tree and a Google Cloud
//! Storage bucket.

pub mod fs;
pub mod gcs;
pub mod transfer;

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

pub use fs::FsObjectStore;
pub use gcs::GcsObjectStore;
pub use transfer::{TransferClient, TransferEvent, TransferStream};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Storage API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Upload incomplete: expected {expected} bytes, store confirmed {confirmed}")]
    Incomplete { expected: u64, confirmed: u64 },
    #[error("Invalid object key: {0}")]
    InvalidKey(String),
    #[error("Transfer cancelled")]
    Cancelled,
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub content_type: String,
    pub size: u64,
}

/// Sink for one object upload.
///
/// Nothing is addressable under the key until [`ObjectWriter::finish`]
/// succeeds. Dropping a writer without finishing it must leave no object.
#[async_trait]
pub trait ObjectWriter: Send {
    /// Append the next chunk.
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()>;
    /// Commit the object and return the byte count the store confirmed.
    async fn finish(&mut self) -> Result<u64>;
    /// Discard everything written so far.
    async fn abort(&mut self);
}

/// A durable object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store identifier for logs.
    fn id(&self) -> &str;

    /// Chunk sizes handed to writers must be a multiple of this.
    fn chunk_alignment(&self) -> usize {
        1
    }

    /// Start an upload of `total` bytes to `key`.
    async fn begin_upload(
        &self,
        key: &str,
        content_type: &str,
        total: u64,
    ) -> Result<Box<dyn ObjectWriter>>;

    /// Metadata for `key`, or `None` if no such object exists.
    async fn metadata(&self, key: &str) -> Result<Option<ObjectMetadata>>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.metadata(key).await?.is_some())
    }

    /// Copy the object to a local file, returning the bytes written.
    async fn download(&self, key: &str, dest: &Path) -> Result<u64>;

    /// Make the object publicly readable and return its public URL.
    async fn make_public(&self, key: &str) -> Result<String>;
}

/// Reject keys that are empty or could escape the store root.
pub fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Guess a MIME type from a file name or key extension.
pub fn content_type_for(name: impl AsRef<Path>) -> &'static str {
    let ext = name
        .as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "m4v" => "video/x-m4v",
        "webm" => "video/webm",
        "3gp" => "video/3gpp",
        "avi" => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}
