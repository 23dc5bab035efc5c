//! Pipeline error taxonomy shared by the client and the orchestrator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal failure of one pipeline run.
///
/// Every variant carries a human-readable message; the variant itself is the
/// machine-readable part and travels over the wire as an [`ErrorKind`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Network or storage I/O failed while uploading the local file.
    #[error("transfer failed: {0}")]
    TransferFailed(String),
    /// The storage key does not reference an object.
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    /// The generative service rejected the file upload.
    #[error("remote submit failed: {0}")]
    RemoteSubmitFailed(String),
    /// The generative service marked the file unusable, or it never became ready.
    #[error("file processing failed: {0}")]
    ProcessingFailed(String),
    /// Generation output did not match the three-style caption schema.
    #[error("malformed caption response: {0}")]
    MalformedResponse(String),
    /// The generation call itself failed.
    #[error("caption generation failed: {0}")]
    GenerationFailed(String),
    /// Durable store failure outside of the upload (download, publish).
    #[error("storage error: {0}")]
    Storage(String),
    /// The request was missing required fields.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The remote orchestrator call could not be completed.
    #[error("remote call failed: {0}")]
    Remote(String),
    /// Another run for the same media asset is in flight.
    #[error("pipeline already running for {0}")]
    AlreadyRunning(String),
    #[error("cancelled")]
    Cancelled,
}

/// Stable, serializable discriminant of [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransferFailed,
    ObjectNotFound,
    RemoteSubmitFailed,
    ProcessingFailed,
    MalformedResponse,
    GenerationFailed,
    Storage,
    InvalidRequest,
    Remote,
    AlreadyRunning,
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::TransferFailed(_) => ErrorKind::TransferFailed,
            PipelineError::ObjectNotFound(_) => ErrorKind::ObjectNotFound,
            PipelineError::RemoteSubmitFailed(_) => ErrorKind::RemoteSubmitFailed,
            PipelineError::ProcessingFailed(_) => ErrorKind::ProcessingFailed,
            PipelineError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            PipelineError::GenerationFailed(_) => ErrorKind::GenerationFailed,
            PipelineError::Storage(_) => ErrorKind::Storage,
            PipelineError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            PipelineError::Remote(_) => ErrorKind::Remote,
            PipelineError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            PipelineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// The detail message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            PipelineError::TransferFailed(m)
            | PipelineError::ObjectNotFound(m)
            | PipelineError::RemoteSubmitFailed(m)
            | PipelineError::ProcessingFailed(m)
            | PipelineError::MalformedResponse(m)
            | PipelineError::GenerationFailed(m)
            | PipelineError::Storage(m)
            | PipelineError::InvalidRequest(m)
            | PipelineError::Remote(m)
            | PipelineError::AlreadyRunning(m) => m,
            PipelineError::Cancelled => "cancelled",
        }
    }

    /// Rebuild an error received over the wire.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::TransferFailed => PipelineError::TransferFailed(message),
            ErrorKind::ObjectNotFound => PipelineError::ObjectNotFound(message),
            ErrorKind::RemoteSubmitFailed => PipelineError::RemoteSubmitFailed(message),
            ErrorKind::ProcessingFailed => PipelineError::ProcessingFailed(message),
            ErrorKind::MalformedResponse => PipelineError::MalformedResponse(message),
            ErrorKind::GenerationFailed => PipelineError::GenerationFailed(message),
            ErrorKind::Storage => PipelineError::Storage(message),
            ErrorKind::InvalidRequest => PipelineError::InvalidRequest(message),
            ErrorKind::Remote => PipelineError::Remote(message),
            ErrorKind::AlreadyRunning => PipelineError::AlreadyRunning(message),
            ErrorKind::Cancelled => PipelineError::Cancelled,
        }
    }
}

/// JSON error body returned by the caption endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PipelineError> for ErrorBody {
    fn from(err: &PipelineError) -> Self {
        Self {
            error: ErrorDetail {
                kind: err.kind(),
                message: err.message().to_string(),
            },
        }
    }
}

impl From<ErrorBody> for PipelineError {
    fn from(body: ErrorBody) -> Self {
        PipelineError::from_kind(body.error.kind, body.error.message)
    }
}
