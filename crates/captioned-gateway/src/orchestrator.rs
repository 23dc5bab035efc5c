//! Caption generation orchestrator.
//!
//! Server-side half of the pipeline: pulls a stored object into a scratch
//! file, stages it on the generative service, waits for it to become active,
//! asks for captions and publishes the object.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use captioned_config::OrchestratorConfig;
use captioned_media::captions::parse_captions;
use captioned_media::poller::ReadinessPoller;
use captioned_media::types::GenerativeService;
use captioned_storage::{ObjectStore, StorageError};
use captioned_types::{
    CaptionRequest, CaptionResponse, CaptionService, CaptionSet, MediaKind, PipelineError,
    RemoteFileHandle, captions_prompt,
};

/// Upper bound on the best-effort delete of a staged remote file.
const REMOTE_CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CaptionOrchestrator {
    store: Arc<dyn ObjectStore>,
    service: Arc<dyn GenerativeService>,
    poller: ReadinessPoller,
    scratch_dir: PathBuf,
    delete_remote_files: bool,
}

impl CaptionOrchestrator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        service: Arc<dyn GenerativeService>,
        poller: ReadinessPoller,
    ) -> Self {
        Self {
            store,
            service,
            poller,
            scratch_dir: std::env::temp_dir(),
            delete_remote_files: true,
        }
    }

    pub fn from_config(
        config: &OrchestratorConfig,
        store: Arc<dyn ObjectStore>,
        service: Arc<dyn GenerativeService>,
    ) -> Self {
        let poller = ReadinessPoller::new(config.poll_interval(), config.processing_deadline());
        Self::new(store, service, poller)
            .with_scratch_dir(config.scratch_dir())
            .with_remote_cleanup(config.delete_remote_files)
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_remote_cleanup(mut self, enabled: bool) -> Self {
        self.delete_remote_files = enabled;
        self
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Run one caption request end to end.
    ///
    /// The scratch copy of the object is removed on every exit path,
    /// including when this future is dropped.
    pub async fn process(
        &self,
        request: CaptionRequest,
        cancel: &CancellationToken,
    ) -> Result<CaptionResponse, PipelineError> {
        let storage_key = request.storage_key.trim().to_string();
        if storage_key.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "a storage key must be provided".into(),
            ));
        }

        let metadata = self
            .store
            .metadata(&storage_key)
            .await
            .map_err(|e| storage_error(&storage_key, e))?
            .ok_or_else(|| PipelineError::ObjectNotFound(storage_key.clone()))?;

        let prompt = if request.prompt.trim().is_empty() {
            let kind = request
                .kind
                .unwrap_or_else(|| infer_kind(&storage_key, &metadata.content_type));
            captions_prompt(kind)
        } else {
            request.prompt
        };

        info!(
            storage_key = %storage_key,
            bytes = metadata.size,
            content_type = %metadata.content_type,
            "Generating captions"
        );

        let scratch = self.scratch_file(&storage_key)?;
        with_cancel(cancel, self.store.download(&storage_key, &scratch))
            .await?
            .map_err(|e| storage_error(&storage_key, e))?;

        let display_name = storage_key.rsplit('/').next().unwrap_or(&storage_key);
        let handle = with_cancel(
            cancel,
            self.service
                .submit_file(&scratch, &metadata.content_type, display_name),
        )
        .await?
        .map_err(|e| PipelineError::RemoteSubmitFailed(format!("{e:#}")))?;
        debug!(
            storage_key = %storage_key,
            remote_id = %handle.remote_id,
            "Submitted to generative service"
        );

        let outcome = self.caption_remote_file(&handle, &prompt, cancel).await;
        drop(scratch);
        if self.delete_remote_files {
            // A cancelled caller is not kept waiting on the delete.
            self.discard_remote_file(handle.remote_id, cancel.is_cancelled())
                .await;
        }
        let captions = outcome?;

        let public_url = self
            .store
            .make_public(&storage_key)
            .await
            .map_err(|e| storage_error(&storage_key, e))?;

        info!(storage_key = %storage_key, public_url = %public_url, "Captions ready");

        Ok(CaptionResponse {
            storage_key,
            public_url,
            captions,
        })
    }

    async fn caption_remote_file(
        &self,
        handle: &RemoteFileHandle,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<CaptionSet, PipelineError> {
        let active = self
            .poller
            .await_ready(self.service.as_ref(), &handle.remote_id, cancel)
            .await?;

        let text = with_cancel(cancel, self.service.generate(prompt, &active))
            .await?
            .map_err(|e| PipelineError::GenerationFailed(format!("{e:#}")))?;

        parse_captions(&text).inspect_err(|e| {
            warn!(remote_id = %active.remote_id, "Unusable caption response: {e}");
        })
    }

    async fn discard_remote_file(&self, remote_id: String, detach: bool) {
        let service = self.service.clone();
        let cleanup = async move {
            match tokio::time::timeout(REMOTE_CLEANUP_TIMEOUT, service.delete_file(&remote_id))
                .await
            {
                Ok(Ok(())) => debug!(remote_id = %remote_id, "Deleted remote file"),
                Ok(Err(e)) => warn!(remote_id = %remote_id, "Failed to delete remote file: {e:#}"),
                Err(_) => warn!(remote_id = %remote_id, "Timed out deleting remote file"),
            }
        };
        if detach {
            tokio::spawn(cleanup);
        } else {
            cleanup.await;
        }
    }

    /// Request-scoped scratch path, deleted when the guard drops.
    fn scratch_file(&self, storage_key: &str) -> Result<TempPath, PipelineError> {
        let suffix = Path::new(storage_key)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        tempfile::Builder::new()
            .prefix("caption-")
            .suffix(&suffix)
            .tempfile_in(&self.scratch_dir)
            .map(|f| f.into_temp_path())
            .map_err(|e| {
                PipelineError::Storage(format!(
                    "failed to create scratch file in {}: {e}",
                    self.scratch_dir.display()
                ))
            })
    }
}

#[async_trait]
impl CaptionService for CaptionOrchestrator {
    async fn generate_captions(
        &self,
        request: CaptionRequest,
    ) -> Result<CaptionResponse, PipelineError> {
        self.process(request, &CancellationToken::new()).await
    }
}

async fn with_cancel<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, PipelineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        out = fut => Ok(out),
    }
}

fn storage_error(key: &str, err: StorageError) -> PipelineError {
    match err {
        StorageError::NotFound(_) => PipelineError::ObjectNotFound(key.to_string()),
        StorageError::InvalidKey(_) => PipelineError::InvalidRequest(err.to_string()),
        other => PipelineError::Storage(other.to_string()),
    }
}

fn infer_kind(storage_key: &str, content_type: &str) -> MediaKind {
    if storage_key.split('/').next() == Some(MediaKind::Video.storage_prefix())
        || content_type.starts_with("video/")
    {
        MediaKind::Video
    } else {
        MediaKind::Photo
    }
}
