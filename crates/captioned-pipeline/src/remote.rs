//! HTTP client for a remote caption gateway.

use std::time::Duration;

use async_trait::async_trait;

use captioned_config::ClientConfig;
use captioned_types::{CaptionRequest, CaptionResponse, CaptionService, ErrorBody, PipelineError};

/// Calls `POST {base}/captions` on a caption gateway.
pub struct HttpCaptionClient {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpCaptionClient {
    pub fn new(base_url: &str, auth_token: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: format!("{}/captions", base_url.trim_end_matches('/')),
            auth_token,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            &config.gateway_url,
            config.auth_token.clone(),
            config.request_timeout(),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CaptionService for HttpCaptionClient {
    async fn generate_captions(
        &self,
        request: CaptionRequest,
    ) -> Result<CaptionResponse, PipelineError> {
        let mut req = self.client.post(&self.endpoint).json(&request);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::Remote(format!("caption request to {} timed out", self.endpoint))
            } else {
                PipelineError::Remote(format!("caption request failed: {e}"))
            }
        })?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| PipelineError::Remote(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<ErrorBody>(&body) {
                Ok(error) => error.into(),
                Err(_) => PipelineError::Remote(format!("gateway returned {status}: {body}")),
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            PipelineError::MalformedResponse(format!("unexpected gateway response: {e}"))
        })
    }
}
