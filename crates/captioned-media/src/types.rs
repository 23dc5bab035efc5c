//! Generative service trait.

use std::path::Path;

use async_trait::async_trait;

use captioned_types::RemoteFileHandle;

/// A generative AI service that ingests files asynchronously.
///
/// Files are submitted first, become usable once the service finishes
/// processing them, and are then referenced from generation requests.
#[async_trait]
pub trait GenerativeService: Send + Sync {
    /// Provider identifier.
    fn id(&self) -> &str;
    /// Upload a local file; the returned handle is usually still processing.
    async fn submit_file(
        &self,
        path: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> anyhow::Result<RemoteFileHandle>;
    /// Fetch the current state of a submitted file.
    async fn get_file(&self, remote_id: &str) -> anyhow::Result<RemoteFileHandle>;
    /// Generate text from a prompt and an active file; returns the raw model text.
    async fn generate(&self, prompt: &str, file: &RemoteFileHandle) -> anyhow::Result<String>;
    /// Remove a submitted file from the service.
    async fn delete_file(&self, remote_id: &str) -> anyhow::Result<()>;
}
