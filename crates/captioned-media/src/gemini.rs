//! Gemini provider: Files API staging and `generateContent`.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use captioned_types::{RemoteFileHandle, RemoteFileState};

use crate::types::GenerativeService;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Whole-request bound for every Gemini call, uploads included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Sampling parameters sent with every generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: "gemini-1.5-flash".to_string(),
            temperature: 0.9,
            top_p: 0.95,
            top_k: 32,
            max_output_tokens: 1024,
        }
    }
}

/// Google Gemini generative service.
pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    settings: GenerationSettings,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_settings(api_key, DEFAULT_BASE_URL.to_string(), GenerationSettings::default())
    }

    pub fn with_settings(api_key: String, base_url: String, settings: GenerationSettings) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            settings,
            client: build_client(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    fn model_path(&self) -> String {
        let model = self.settings.model.trim_start_matches("models/");
        format!("{}/v1beta/models/{model}:generateContent", self.base_url)
    }

    /// File resources are named `files/{id}`; accept either form.
    fn file_url(&self, remote_id: &str) -> String {
        let name = remote_id.trim_start_matches("files/");
        format!("{}/v1beta/files/{name}", self.base_url)
    }

    fn generation_body(&self, prompt: &str, file: &RemoteFileHandle) -> serde_json::Value {
        serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": prompt },
                    {
                        "fileData": {
                            "mimeType": file.mime_type,
                            "fileUri": file.uri
                        }
                    }
                ]
            }],
            "generationConfig": {
                "temperature": self.settings.temperature,
                "topP": self.settings.top_p,
                "topK": self.settings.top_k,
                "maxOutputTokens": self.settings.max_output_tokens,
                "responseMimeType": "application/json"
            }
        })
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// File resource as returned by the Files API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiFile {
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    state: GeminiFileState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum GeminiFileState {
    #[default]
    StateUnspecified,
    Processing,
    Active,
    Failed,
    #[serde(other)]
    Unknown,
}

impl From<GeminiFile> for RemoteFileHandle {
    fn from(file: GeminiFile) -> Self {
        let state = match file.state {
            GeminiFileState::Processing => RemoteFileState::Processing,
            GeminiFileState::Active => RemoteFileState::Active,
            GeminiFileState::Failed
            | GeminiFileState::StateUnspecified
            | GeminiFileState::Unknown => RemoteFileState::Failed,
        };
        RemoteFileHandle {
            remote_id: file.name,
            mime_type: file.mime_type,
            uri: file.uri,
            state,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: GeminiFile,
}

/// Concatenated text of the first candidate, if any.
fn candidate_text(json: &serde_json::Value) -> Option<String> {
    let parts = json.pointer("/candidates/0/content/parts")?.as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

async fn api_error(context: &str, resp: reqwest::Response) -> anyhow::Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let msg = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or(body);
    anyhow::anyhow!("{context} ({status}): {msg}")
}

#[async_trait]
impl GenerativeService for GeminiProvider {
    fn id(&self) -> &str {
        "gemini"
    }

    async fn submit_file(
        &self,
        path: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> anyhow::Result<RemoteFileHandle> {
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();

        let start = self
            .client
            .post(format!("{}/upload/v1beta/files", self.base_url))
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", size.to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&serde_json::json!({ "file": { "display_name": display_name } }))
            .send()
            .await?;
        if !start.status().is_success() {
            return Err(api_error("Gemini upload start failed", start).await);
        }
        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .context("Gemini upload start returned no upload URL")?;

        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let resp = self
            .client
            .post(upload_url)
            .header(reqwest::header::CONTENT_LENGTH, size.to_string())
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(api_error("Gemini upload failed", resp).await);
        }

        let uploaded: UploadResponse = resp.json().await?;
        tracing::debug!(
            name = %uploaded.file.name,
            size,
            "Submitted file to Gemini"
        );
        Ok(uploaded.file.into())
    }

    async fn get_file(&self, remote_id: &str) -> anyhow::Result<RemoteFileHandle> {
        let resp = self
            .client
            .get(self.file_url(remote_id))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(api_error("Gemini file lookup failed", resp).await);
        }
        let file: GeminiFile = resp.json().await?;
        Ok(file.into())
    }

    async fn generate(&self, prompt: &str, file: &RemoteFileHandle) -> anyhow::Result<String> {
        let resp = self
            .client
            .post(self.model_path())
            .header("x-goog-api-key", &self.api_key)
            .json(&self.generation_body(prompt, file))
            .send()
            .await?;

        let status = resp.status();
        let json: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            let msg = json
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("Unknown error");
            return Err(anyhow::anyhow!("Gemini API error ({status}): {msg}"));
        }

        candidate_text(&json).ok_or_else(|| {
            let reason = json
                .pointer("/promptFeedback/blockReason")
                .or_else(|| json.pointer("/candidates/0/finishReason"))
                .and_then(|r| r.as_str())
                .unwrap_or("no candidates");
            anyhow::anyhow!("Gemini returned no text: {reason}")
        })
    }

    async fn delete_file(&self, remote_id: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .delete(self.file_url(remote_id))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(api_error("Gemini file delete failed", resp).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> RemoteFileHandle {
        RemoteFileHandle {
            remote_id: "files/abc123".into(),
            mime_type: "video/mp4".into(),
            uri: "https://generativelanguage.googleapis.com/v1beta/files/abc123".into(),
            state: RemoteFileState::Active,
        }
    }

    #[test]
    fn test_file_state_mapping() {
        let file: GeminiFile = serde_json::from_str(
            r#"{"name":"files/x","mimeType":"image/jpeg","uri":"u","state":"PROCESSING"}"#,
        )
        .unwrap();
        assert_eq!(RemoteFileHandle::from(file).state, RemoteFileState::Processing);

        let file: GeminiFile =
            serde_json::from_str(r#"{"name":"files/x","state":"ACTIVE"}"#).unwrap();
        assert_eq!(RemoteFileHandle::from(file).state, RemoteFileState::Active);

        let file: GeminiFile =
            serde_json::from_str(r#"{"name":"files/x","state":"SOMETHING_NEW"}"#).unwrap();
        assert_eq!(RemoteFileHandle::from(file).state, RemoteFileState::Failed);

        let file: GeminiFile = serde_json::from_str(r#"{"name":"files/x"}"#).unwrap();
        assert_eq!(RemoteFileHandle::from(file).state, RemoteFileState::Failed);
    }

    #[test]
    fn test_generation_body() {
        let provider = GeminiProvider::new("key".into());
        let body = provider.generation_body("describe", &handle());
        assert_eq!(body.pointer("/contents/0/parts/0/text").unwrap(), "describe");
        assert_eq!(
            body.pointer("/contents/0/parts/1/fileData/mimeType").unwrap(),
            "video/mp4"
        );
        assert_eq!(
            body.pointer("/generationConfig/responseMimeType").unwrap(),
            "application/json"
        );
        assert_eq!(body.pointer("/generationConfig/topK").unwrap(), 32);
        assert_eq!(body.pointer("/generationConfig/maxOutputTokens").unwrap(), 1024);
    }

    #[test]
    fn test_urls() {
        let provider = GeminiProvider::with_settings(
            "key".into(),
            "http://localhost:9000/".into(),
            GenerationSettings {
                model: "models/gemini-1.5-pro".into(),
                ..Default::default()
            },
        );
        assert_eq!(
            provider.model_path(),
            "http://localhost:9000/v1beta/models/gemini-1.5-pro:generateContent"
        );
        assert_eq!(
            provider.file_url("files/abc"),
            "http://localhost:9000/v1beta/files/abc"
        );
        assert_eq!(provider.file_url("abc"), "http://localhost:9000/v1beta/files/abc");
    }

    #[test]
    fn test_candidate_text() {
        let json = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "{\"captions\":" }, { "text": "[]}" }] }
            }]
        });
        assert_eq!(candidate_text(&json).as_deref(), Some("{\"captions\":[]}"));
        assert!(candidate_text(&serde_json::json!({ "candidates": [] })).is_none());
    }
}
