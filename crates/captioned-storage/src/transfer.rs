//! Storage transfer client: streams a local file into an [`ObjectStore`] and
//! reports progress as a lazy stream of events.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use captioned_types::TransferProgress;

use crate::{ObjectStore, ObjectWriter, Result, StorageError, content_type_for};

/// One observation from an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Bytes handed to the store so far. Non-decreasing within one upload.
    Progress(TransferProgress),
    /// The store confirmed the full object. Emitted exactly once, last.
    Completed { key: String, bytes: u64 },
}

pub type TransferStream = Pin<Box<dyn Stream<Item = Result<TransferEvent>> + Send>>;

/// Uploads local files to a durable store in fixed-size chunks.
#[derive(Clone)]
pub struct TransferClient {
    store: Arc<dyn ObjectStore>,
    chunk_size: usize,
}

impl TransferClient {
    /// The chunk size is rounded up to the store's alignment.
    pub fn new(store: Arc<dyn ObjectStore>, chunk_size: usize) -> Self {
        let align = store.chunk_alignment().max(1);
        let chunk_size = chunk_size.max(1).div_ceil(align) * align;
        Self { store, chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Upload `local_path` to `key`.
    ///
    /// Nothing happens until the stream is polled; each call starts a fresh
    /// transfer. The stream yields an initial zero progress, one progress
    /// event per chunk, then either `Completed` or a single error. On error
    /// or cancellation the partial upload is aborted. The local file is
    /// never modified.
    pub fn upload(
        &self,
        local_path: impl Into<PathBuf>,
        key: impl Into<String>,
        cancel: CancellationToken,
    ) -> TransferStream {
        let state = UploadState::Pending {
            store: self.store.clone(),
            local_path: local_path.into(),
            key: key.into(),
        };
        let chunk_size = self.chunk_size;
        Box::pin(futures::stream::unfold(state, move |state| {
            step(state, chunk_size, cancel.clone())
        }))
    }
}

enum UploadState {
    Pending {
        store: Arc<dyn ObjectStore>,
        local_path: PathBuf,
        key: String,
    },
    Sending {
        file: tokio::fs::File,
        writer: Box<dyn ObjectWriter>,
        key: String,
        sent: u64,
        total: u64,
    },
    Done,
}

type Step = Option<(Result<TransferEvent>, UploadState)>;

async fn step(state: UploadState, chunk_size: usize, cancel: CancellationToken) -> Step {
    match state {
        UploadState::Done => None,
        UploadState::Pending {
            store,
            local_path,
            key,
        } => {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StorageError::Cancelled),
                r = open(store.as_ref(), &local_path, &key) => r,
            };
            match opened {
                Ok((file, writer, total)) => {
                    info!(key, total, store = store.id(), "Upload started");
                    Some((
                        Ok(TransferEvent::Progress(TransferProgress::new(0, total))),
                        UploadState::Sending {
                            file,
                            writer,
                            key,
                            sent: 0,
                            total,
                        },
                    ))
                }
                Err(e) => {
                    warn!(key, path = %local_path.display(), "Upload could not start: {e}");
                    Some((Err(e), UploadState::Done))
                }
            }
        }
        UploadState::Sending {
            mut file,
            mut writer,
            key,
            sent,
            total,
        } => {
            if sent >= total {
                let finished = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(StorageError::Cancelled),
                    r = writer.finish() => r,
                };
                return Some(match finished {
                    Ok(confirmed) if confirmed == total => {
                        info!(key, bytes = confirmed, "Upload completed");
                        (
                            Ok(TransferEvent::Completed {
                                key,
                                bytes: confirmed,
                            }),
                            UploadState::Done,
                        )
                    }
                    Ok(confirmed) => {
                        warn!(key, expected = total, confirmed, "Store confirmed a different size");
                        (
                            Err(StorageError::Incomplete {
                                expected: total,
                                confirmed,
                            }),
                            UploadState::Done,
                        )
                    }
                    Err(e) => fail(writer, &key, e).await,
                });
            }

            let want = (total - sent).min(chunk_size as u64);
            let sent_chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StorageError::Cancelled),
                r = send_chunk(&mut file, writer.as_mut(), want) => r,
            };
            match sent_chunk {
                Ok(n) => {
                    let sent = sent + n;
                    debug!(key, sent, total, "Chunk uploaded");
                    Some((
                        Ok(TransferEvent::Progress(TransferProgress::new(sent, total))),
                        UploadState::Sending {
                            file,
                            writer,
                            key,
                            sent,
                            total,
                        },
                    ))
                }
                Err(e) => Some(fail(writer, &key, e).await),
            }
        }
    }
}

async fn open(
    store: &dyn ObjectStore,
    local_path: &Path,
    key: &str,
) -> Result<(tokio::fs::File, Box<dyn ObjectWriter>, u64)> {
    let file = tokio::fs::File::open(local_path).await?;
    let total = file.metadata().await?.len();
    let writer = store
        .begin_upload(key, content_type_for(local_path), total)
        .await?;
    Ok((file, writer, total))
}

/// Read up to `want` bytes and hand them to the writer.
async fn send_chunk(
    file: &mut tokio::fs::File,
    writer: &mut dyn ObjectWriter,
    want: u64,
) -> Result<u64> {
    let mut buf = Vec::with_capacity(want as usize);
    file.take(want).read_to_end(&mut buf).await?;
    if buf.is_empty() {
        return Err(StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "local file shrank during upload",
        )));
    }
    let n = buf.len() as u64;
    writer.write_chunk(Bytes::from(buf)).await?;
    Ok(n)
}

async fn fail(
    mut writer: Box<dyn ObjectWriter>,
    key: &str,
    err: StorageError,
) -> (Result<TransferEvent>, UploadState) {
    warn!(key, "Upload failed: {err}");
    writer.abort().await;
    (Err(err), UploadState::Done)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use futures::StreamExt;

    use super::*;
    use crate::{FsObjectStore, ObjectMetadata};

    fn write_file(dir: &Path, name: &str, len: usize) -> PathBuf {
        let path = dir.join(name);
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    async fn collect(stream: TransferStream) -> Vec<Result<TransferEvent>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_file(dir.path(), "IMG_0001.jpg", 10_000);
        let store = Arc::new(FsObjectStore::new(dir.path().join("bucket"), None));
        let client = TransferClient::new(store.clone(), 3_000);

        let events = collect(client.upload(&src, "images/IMG_0001.jpg", CancellationToken::new())).await;

        let mut last = 0;
        let mut progress = Vec::new();
        for event in &events[..events.len() - 1] {
            match event {
                Ok(TransferEvent::Progress(p)) => {
                    assert!(p.bytes_sent >= last);
                    assert!((0.0..=1.0).contains(&p.ratio()));
                    last = p.bytes_sent;
                    progress.push(*p);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        // 0, 3000, 6000, 9000, 10000
        assert_eq!(progress.len(), 5);
        assert_eq!(progress.last().unwrap().bytes_sent, 10_000);
        assert_eq!(progress.last().unwrap().bytes_total, 10_000);
        assert_eq!(
            events.last().unwrap().as_ref().unwrap(),
            &TransferEvent::Completed {
                key: "images/IMG_0001.jpg".into(),
                bytes: 10_000
            }
        );

        assert_eq!(
            std::fs::read(dir.path().join("bucket/images/IMG_0001.jpg")).unwrap(),
            std::fs::read(&src).unwrap()
        );
        // Local file untouched.
        assert!(src.exists());
    }

    #[tokio::test]
    async fn test_stream_is_lazy_and_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_file(dir.path(), "clip.mp4", 512);
        let store = Arc::new(FsObjectStore::new(dir.path().join("bucket"), None));
        let client = TransferClient::new(store.clone(), 1024);

        let stream = client.upload(&src, "videos/clip.mp4", CancellationToken::new());
        assert!(!store.exists("videos/clip.mp4").await.unwrap());
        drop(stream);
        assert!(!dir.path().join("bucket/videos").exists());

        for _ in 0..2 {
            let events = collect(client.upload(&src, "videos/clip.mp4", CancellationToken::new())).await;
            assert!(matches!(
                events.last(),
                Some(Ok(TransferEvent::Completed { bytes: 512, .. }))
            ));
        }
    }

    #[tokio::test]
    async fn test_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_file(dir.path(), "empty.jpg", 0);
        let store = Arc::new(FsObjectStore::new(dir.path().join("bucket"), None));
        let client = TransferClient::new(store.clone(), 1024);

        let events = collect(client.upload(&src, "images/empty.jpg", CancellationToken::new())).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            Ok(TransferEvent::Completed { bytes: 0, .. })
        ));
        assert!(store.exists("images/empty.jpg").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path().join("bucket"), None));
        let client = TransferClient::new(store, 1024);

        let events = collect(client.upload(
            dir.path().join("nope.jpg"),
            "images/nope.jpg",
            CancellationToken::new(),
        ))
        .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(StorageError::Io(_))));
    }

    #[tokio::test]
    async fn test_cancel_mid_upload_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_file(dir.path(), "big.mov", 8_000);
        let store = Arc::new(FsObjectStore::new(dir.path().join("bucket"), None));
        let client = TransferClient::new(store.clone(), 1_000);
        let cancel = CancellationToken::new();

        let mut stream = client.upload(&src, "videos/big.mov", cancel.clone());
        let mut saw_error = None;
        while let Some(event) = stream.next().await {
            match event {
                Ok(TransferEvent::Progress(p)) if p.bytes_sent >= 3_000 => cancel.cancel(),
                Ok(TransferEvent::Progress(_)) => {}
                Ok(TransferEvent::Completed { .. }) => panic!("cancelled upload completed"),
                Err(e) => saw_error = Some(e),
            }
        }
        assert!(matches!(saw_error, Some(StorageError::Cancelled)));
        assert!(!store.exists("videos/big.mov").await.unwrap());
        let leftovers = std::fs::read_dir(dir.path().join("bucket/videos")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    /// Store whose writer fails once a byte threshold is crossed.
    struct FlakyStore {
        fail_after: u64,
        aborted: Arc<AtomicBool>,
    }

    struct FlakyWriter {
        written: u64,
        fail_after: u64,
        aborted: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ObjectWriter for FlakyWriter {
        async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
            if self.written + chunk.len() as u64 > self.fail_after {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                )));
            }
            self.written += chunk.len() as u64;
            Ok(())
        }

        async fn finish(&mut self) -> Result<u64> {
            Ok(self.written)
        }

        async fn abort(&mut self) {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        fn id(&self) -> &str {
            "flaky"
        }

        async fn begin_upload(&self, _: &str, _: &str, _: u64) -> Result<Box<dyn ObjectWriter>> {
            Ok(Box::new(FlakyWriter {
                written: 0,
                fail_after: self.fail_after,
                aborted: self.aborted.clone(),
            }))
        }

        async fn metadata(&self, _: &str) -> Result<Option<ObjectMetadata>> {
            Ok(None)
        }

        async fn download(&self, key: &str, _: &Path) -> Result<u64> {
            Err(StorageError::NotFound(key.to_string()))
        }

        async fn make_public(&self, key: &str) -> Result<String> {
            Err(StorageError::NotFound(key.to_string()))
        }
    }

    #[tokio::test]
    async fn test_interrupted_upload_fails_without_completion() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_file(dir.path(), "photo.jpg", 10_000);
        let aborted = Arc::new(AtomicBool::new(false));
        let store = Arc::new(FlakyStore {
            fail_after: 4_000,
            aborted: aborted.clone(),
        });
        let client = TransferClient::new(store, 2_000);

        let events = collect(client.upload(&src, "images/photo.jpg", CancellationToken::new())).await;

        let last_progress = events
            .iter()
            .filter_map(|e| match e {
                Ok(TransferEvent::Progress(p)) => Some(p.ratio()),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last_progress, 0.4);
        assert!(matches!(events.last(), Some(Err(StorageError::Io(_)))));
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, Ok(TransferEvent::Completed { .. })))
        );
        assert!(aborted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_chunk_size_alignment() {
        let store: Arc<dyn ObjectStore> = Arc::new(crate::GcsObjectStore::new("b", None));
        assert_eq!(TransferClient::new(store.clone(), 1).chunk_size(), 256 * 1024);
        assert_eq!(
            TransferClient::new(store, 300 * 1024).chunk_size(),
            512 * 1024
        );
    }
}
