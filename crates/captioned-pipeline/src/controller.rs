//! Pipeline controller: upload, caption, publish.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use captioned_storage::{StorageError, TransferClient, TransferEvent};
use captioned_types::{
    CaptionRequest, CaptionService, MediaAsset, PipelineError, PipelineResult, captions_prompt,
};

use crate::events::{PhaseListener, PipelinePhase};
use crate::result_store::{ResultReader, ResultStore};

/// Drives one media asset through the caption pipeline.
pub struct PipelineController {
    transfer: TransferClient,
    captions: Arc<dyn CaptionService>,
    results: ResultStore,
    in_flight: Mutex<HashSet<PathBuf>>,
}

impl PipelineController {
    pub fn new(
        transfer: TransferClient,
        captions: Arc<dyn CaptionService>,
        results: ResultStore,
    ) -> Self {
        Self {
            transfer,
            captions,
            results,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Read-only view of the latest result. Only the controller writes it.
    pub fn results(&self) -> ResultReader {
        self.results.reader()
    }

    /// Forget the latest result.
    pub fn reset_results(&self) {
        self.results.reset();
    }

    /// Run the pipeline for `asset`.
    ///
    /// The result is published to the [`ResultStore`] before `Succeeded` is
    /// reported; on failure the store is left as it was. A second run for the
    /// same local file while one is in flight fails with
    /// [`PipelineError::AlreadyRunning`] and reports nothing.
    pub async fn run(
        &self,
        asset: MediaAsset,
        listener: &dyn PhaseListener,
        cancel: &CancellationToken,
    ) -> Result<Arc<PipelineResult>, PipelineError> {
        let _claim = self.claim(&asset)?;
        listener.on_phase(PipelinePhase::Idle);

        match self.drive(asset, listener, cancel).await {
            Ok(result) => {
                let result = self.results.set(result);
                info!(
                    storage_key = ?result.media_asset.storage_key,
                    public_url = %result.public_url,
                    "Pipeline succeeded"
                );
                listener.on_phase(PipelinePhase::Succeeded(result.clone()));
                Ok(result)
            }
            Err(e) => {
                warn!(kind = ?e.kind(), "Pipeline failed: {e}");
                listener.on_phase(PipelinePhase::Failed(e.clone()));
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        asset: MediaAsset,
        listener: &dyn PhaseListener,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult, PipelineError> {
        let key = asset.destination_key().ok_or_else(|| {
            PipelineError::InvalidRequest(format!(
                "{} has no usable file name",
                asset.path().display()
            ))
        })?;

        let mut uploads = self.transfer.upload(asset.path(), key, cancel.clone());
        let mut stored_key = None;
        while let Some(event) = uploads.next().await {
            match event.map_err(transfer_error)? {
                TransferEvent::Progress(progress) => {
                    listener.on_phase(PipelinePhase::Uploading(progress));
                }
                TransferEvent::Completed { key, bytes } => {
                    info!(storage_key = %key, bytes, "Upload complete");
                    stored_key = Some(key);
                    break;
                }
            }
        }
        let storage_key = stored_key.ok_or_else(|| {
            PipelineError::TransferFailed("upload ended before the store confirmed it".into())
        })?;

        listener.on_phase(PipelinePhase::Generating);
        let request = CaptionRequest {
            storage_key,
            prompt: captions_prompt(asset.kind),
            kind: Some(asset.kind),
        };
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            r = self.captions.generate_captions(request) => r?,
        };

        Ok(PipelineResult {
            media_asset: asset.with_storage_key(response.storage_key),
            captions: response.captions,
            public_url: response.public_url,
            generated_at: Utc::now(),
        })
    }

    fn claim(&self, asset: &MediaAsset) -> Result<InFlight<'_>, PipelineError> {
        let path = asset.local_path.clone();
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(path.clone()) {
            return Err(PipelineError::AlreadyRunning(path.display().to_string()));
        }
        Ok(InFlight {
            set: &self.in_flight,
            path,
        })
    }
}

/// Releases an in-flight claim on drop.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<PathBuf>>,
    path: PathBuf,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.path);
    }
}

fn transfer_error(err: StorageError) -> PipelineError {
    match err {
        StorageError::Cancelled => PipelineError::Cancelled,
        other => PipelineError::TransferFailed(other.to_string()),
    }
}
