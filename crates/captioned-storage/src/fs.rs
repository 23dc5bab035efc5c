//! Filesystem object store.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::{
    ObjectMetadata, ObjectStore, ObjectWriter, Result, StorageError, content_type_for,
    validate_key,
};

/// Object store rooted at a local directory; keys map to relative paths.
pub struct FsObjectStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of `key` under the root.
    pub fn object_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn id(&self) -> &str {
        "fs"
    }

    async fn begin_upload(
        &self,
        key: &str,
        _content_type: &str,
        total: u64,
    ) -> Result<Box<dyn ObjectWriter>> {
        let dest = self.object_path(key)?;
        let parent = dest
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        tokio::fs::create_dir_all(parent).await?;

        let name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        let partial = parent.join(format!(".{name}.{}.partial", uuid::Uuid::new_v4()));
        let file = tokio::fs::File::create(&partial).await?;

        tracing::debug!(key, partial = %partial.display(), total, "Started fs upload");

        Ok(Box::new(FsObjectWriter {
            file: Some(file),
            partial,
            dest,
            expected: total,
            written: 0,
            settled: false,
        }))
    }

    async fn metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let path = self.object_path(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMetadata {
                content_type: content_type_for(key).to_string(),
                size: meta.len(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64> {
        let path = self.object_path(key)?;
        match tokio::fs::copy(&path, dest).await {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn make_public(&self, key: &str) -> Result<String> {
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        match &self.public_base_url {
            Some(base) => Ok(format!("{}/{key}", base.trim_end_matches('/'))),
            None => {
                let path = std::path::absolute(self.object_path(key)?)?;
                url::Url::from_file_path(&path)
                    .map(|u| u.to_string())
                    .map_err(|_| StorageError::InvalidKey(key.to_string()))
            }
        }
    }
}

/// Writes to a hidden partial file next to the destination and renames it
/// into place on finish.
struct FsObjectWriter {
    file: Option<tokio::fs::File>,
    partial: PathBuf,
    dest: PathBuf,
    expected: u64,
    written: u64,
    settled: bool,
}

impl FsObjectWriter {
    fn file(&mut self) -> Result<&mut tokio::fs::File> {
        self.file
            .as_mut()
            .ok_or_else(|| StorageError::Io(std::io::Error::other("writer already closed")))
    }

    async fn discard(&mut self) {
        self.file.take();
        match tokio::fs::remove_file(&self.partial).await {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                tracing::warn!(partial = %self.partial.display(), "Failed to remove partial upload: {e}");
            }
            _ => {}
        }
        self.settled = true;
    }
}

#[async_trait]
impl ObjectWriter for FsObjectWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        let len = chunk.len() as u64;
        self.file()?.write_all(&chunk).await?;
        self.written += len;
        Ok(())
    }

    async fn finish(&mut self) -> Result<u64> {
        if self.written != self.expected {
            let confirmed = self.written;
            self.discard().await;
            return Err(StorageError::Incomplete {
                expected: self.expected,
                confirmed,
            });
        }
        let mut file = self
            .file
            .take()
            .ok_or_else(|| StorageError::Io(std::io::Error::other("writer already closed")))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&self.partial, &self.dest).await?;
        self.settled = true;
        Ok(self.written)
    }

    async fn abort(&mut self) {
        self.discard().await;
    }
}

impl Drop for FsObjectWriter {
    fn drop(&mut self) {
        if !self.settled {
            let _ = std::fs::remove_file(&self.partial);
        }
    }
}
