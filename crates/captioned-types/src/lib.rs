use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod prompt;

pub use error::{ErrorBody, ErrorKind, PipelineError};
pub use prompt::captions_prompt;

// ──────────────────── Media Types ────────────────────

/// Classification of a captured media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    /// Storage prefix objects of this kind are written under.
    pub fn storage_prefix(&self) -> &'static str {
        match self {
            MediaKind::Photo => "images",
            MediaKind::Video => "videos",
        }
    }

    /// Noun used in the captioning prompt.
    pub fn noun(&self) -> &'static str {
        match self {
            MediaKind::Photo => "image",
            MediaKind::Video => "video",
        }
    }
}

/// A captured photo or video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAsset {
    /// Path of the captured file on the local device.
    pub local_path: PathBuf,
    pub kind: MediaKind,
    /// Assigned once the transfer to durable storage completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
}

impl MediaAsset {
    pub fn new(local_path: impl Into<PathBuf>, kind: MediaKind) -> Self {
        Self {
            local_path: local_path.into(),
            kind,
            storage_key: None,
        }
    }

    /// Last path segment of the local file.
    pub fn file_name(&self) -> Option<&str> {
        self.local_path.file_name().and_then(|n| n.to_str())
    }

    /// Destination key in durable storage (`images/<name>` or `videos/<name>`).
    pub fn destination_key(&self) -> Option<String> {
        self.file_name()
            .filter(|n| !n.is_empty())
            .map(|name| format!("{}/{name}", self.kind.storage_prefix()))
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = Some(key.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.local_path
    }
}

// ──────────────────── Transfer Types ────────────────────

/// Byte counters of an in-flight upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub bytes_sent: u64,
    pub bytes_total: u64,
}

impl TransferProgress {
    pub fn new(bytes_sent: u64, bytes_total: u64) -> Self {
        Self {
            bytes_sent,
            bytes_total,
        }
    }

    /// Fraction sent, always within `[0, 1]`.
    pub fn ratio(&self) -> f64 {
        if self.bytes_total == 0 {
            return if self.is_complete() { 1.0 } else { 0.0 };
        }
        (self.bytes_sent as f64 / self.bytes_total as f64).clamp(0.0, 1.0)
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_sent >= self.bytes_total
    }
}

// ──────────────────── Generative Service Types ────────────────────

/// Processing state of a file on the generative service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteFileState {
    Processing,
    Active,
    Failed,
}

/// The generative service's reference to an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileHandle {
    /// Service-side resource name (e.g. "files/abc123").
    pub remote_id: String,
    pub mime_type: String,
    pub uri: String,
    pub state: RemoteFileState,
}

// ──────────────────── Caption Types ────────────────────

/// One of the three caption styles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptionStyle {
    Minimalist,
    ShortSentence,
    Detailed,
}

impl CaptionStyle {
    pub const ALL: [CaptionStyle; 3] = [
        CaptionStyle::Minimalist,
        CaptionStyle::ShortSentence,
        CaptionStyle::Detailed,
    ];
}

/// A single caption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caption {
    #[serde(rename = "type")]
    pub style: CaptionStyle,
    #[serde(rename = "caption")]
    pub text: String,
}

impl Caption {
    pub fn new(style: CaptionStyle, text: impl Into<String>) -> Self {
        Self {
            style,
            text: text.into(),
        }
    }
}

/// Exactly one caption per style, in canonical style order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Caption>", into = "Vec<Caption>")]
pub struct CaptionSet(Vec<Caption>);

impl CaptionSet {
    /// Validate and order a list of captions.
    pub fn new(mut captions: Vec<Caption>) -> Result<Self, PipelineError> {
        if captions.len() != CaptionStyle::ALL.len() {
            return Err(PipelineError::MalformedResponse(format!(
                "expected {} captions, got {}",
                CaptionStyle::ALL.len(),
                captions.len()
            )));
        }
        captions.sort_by_key(|c| c.style);
        for (caption, style) in captions.iter().zip(CaptionStyle::ALL) {
            if caption.style != style {
                return Err(PipelineError::MalformedResponse(format!(
                    "duplicate caption style {:?}",
                    caption.style
                )));
            }
            if caption.text.trim().is_empty() {
                return Err(PipelineError::MalformedResponse(format!(
                    "empty caption for style {style:?}"
                )));
            }
        }
        Ok(Self(captions))
    }

    pub fn get(&self, style: CaptionStyle) -> Option<&str> {
        self.0
            .iter()
            .find(|c| c.style == style)
            .map(|c| c.text.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Caption> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Caption] {
        &self.0
    }
}

impl TryFrom<Vec<Caption>> for CaptionSet {
    type Error = PipelineError;

    fn try_from(captions: Vec<Caption>) -> Result<Self, Self::Error> {
        CaptionSet::new(captions)
    }
}

impl From<CaptionSet> for Vec<Caption> {
    fn from(set: CaptionSet) -> Self {
        set.0
    }
}

/// Structured output requested from the generative model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionPayload {
    pub captions: Vec<Caption>,
}

// ──────────────────── Pipeline Types ────────────────────

/// Outcome of one successful pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub media_asset: MediaAsset,
    pub captions: CaptionSet,
    pub public_url: String,
    pub generated_at: DateTime<Utc>,
}

/// Request to the caption orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptionRequest {
    pub storage_key: String,
    /// Captioning instructions; the orchestrator builds its own when empty.
    #[serde(default)]
    pub prompt: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
}

/// Orchestrator reply for a [`CaptionRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptionResponse {
    pub storage_key: String,
    pub public_url: String,
    pub captions: CaptionSet,
}

/// Seam between the pipeline controller and the caption orchestrator.
///
/// Implemented in-process by the orchestrator and remotely by the HTTP client.
#[async_trait]
pub trait CaptionService: Send + Sync {
    async fn generate_captions(
        &self,
        request: CaptionRequest,
    ) -> Result<CaptionResponse, PipelineError>;
}
