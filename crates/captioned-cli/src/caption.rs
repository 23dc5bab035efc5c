use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use captioned_gateway::{
    CaptionOrchestrator, generative_service_from_config, object_store_from_config,
};
use captioned_pipeline::{HttpCaptionClient, PipelineController, PipelinePhase, ResultStore};
use captioned_storage::{TransferClient, content_type_for};
use captioned_types::{CaptionService, MediaAsset, MediaKind};

/// Run the whole pipeline for one local file and print the captions.
pub async fn run_caption(
    path: PathBuf,
    kind: Option<MediaKind>,
    gateway: Option<String>,
    in_process: bool,
) -> anyhow::Result<()> {
    let config = captioned_config::load_config()?;
    let kind = match kind {
        Some(kind) => kind,
        None => infer_kind(&path).with_context(|| {
            format!(
                "cannot tell whether {} is a photo or a video; pass --kind",
                path.display()
            )
        })?,
    };

    let store = object_store_from_config(&config.storage)?;
    let captions: Arc<dyn CaptionService> = if in_process {
        let service = generative_service_from_config(&config.gemini)?;
        Arc::new(CaptionOrchestrator::from_config(
            &config.orchestrator,
            store.clone(),
            service,
        ))
    } else {
        let mut client_config = config.client.clone();
        if let Some(url) = gateway {
            client_config.gateway_url = url;
        }
        Arc::new(HttpCaptionClient::from_config(&client_config))
    };

    let results = ResultStore::new();
    let reader = results.reader();
    let controller = PipelineController::new(
        TransferClient::new(store, config.storage.chunk_size),
        captions,
        results,
    );

    let cancel = CancellationToken::new();
    crate::cancel_on_ctrl_c(cancel.clone());

    let (tx, rx) = mpsc::unbounded_channel();
    let display = tokio::spawn(show_phases(rx));

    let outcome = controller
        .run(MediaAsset::new(path, kind), &tx, &cancel)
        .await;
    drop(tx);
    let _ = display.await;

    outcome?;
    let result = reader.get().context("pipeline finished without a result")?;
    println!("{}", result.public_url);
    for caption in result.captions.iter() {
        println!();
        println!("[{:?}]", caption.style);
        println!("{}", caption.text);
    }
    Ok(())
}

/// Print phase changes to stderr until the controller is done.
async fn show_phases(mut rx: mpsc::UnboundedReceiver<PipelinePhase>) {
    let mut stderr = std::io::stderr();
    while let Some(phase) = rx.recv().await {
        match phase {
            PipelinePhase::Idle => {}
            PipelinePhase::Uploading(progress) => {
                let _ = write!(
                    stderr,
                    "\rUploading... {:>3.0}% ({}/{} bytes)",
                    progress.ratio() * 100.0,
                    progress.bytes_sent,
                    progress.bytes_total
                );
                let _ = stderr.flush();
            }
            PipelinePhase::Generating => {
                let _ = writeln!(stderr);
                let _ = writeln!(stderr, "Generating captions...");
            }
            PipelinePhase::Succeeded(_) => {}
            PipelinePhase::Failed(e) => {
                let _ = writeln!(stderr);
                let _ = writeln!(stderr, "Failed: {e}");
            }
        }
    }
}

fn infer_kind(path: &Path) -> Option<MediaKind> {
    let content_type = content_type_for(path);
    if content_type.starts_with("image/") {
        Some(MediaKind::Photo)
    } else if content_type.starts_with("video/") {
        Some(MediaKind::Video)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_kind() {
        assert_eq!(infer_kind(Path::new("/dcim/IMG_1.HEIC")), Some(MediaKind::Photo));
        assert_eq!(infer_kind(Path::new("clip.mov")), Some(MediaKind::Video));
        assert_eq!(infer_kind(Path::new("notes.txt")), None);
    }
}
