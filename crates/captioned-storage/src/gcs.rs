//! Google Cloud Storage object store (JSON API).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::{ObjectMetadata, ObjectStore, ObjectWriter, Result, StorageError, validate_key};

const DEFAULT_BASE_URL: &str = "https://storage.googleapis.com";

/// Resumable upload chunks must be multiples of 256 KiB (except the last).
pub const GCS_CHUNK_ALIGNMENT: usize = 256 * 1024;

/// Object store backed by a GCS bucket.
pub struct GcsObjectStore {
    client: Client,
    base_url: String,
    bucket: String,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsObject {
    #[serde(default)]
    content_type: Option<String>,
    /// GCS encodes sizes as decimal strings.
    #[serde(default)]
    size: Option<String>,
}

impl GcsObject {
    fn size(&self) -> u64 {
        self.size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

impl GcsObjectStore {
    pub fn new(bucket: impl Into<String>, access_token: Option<String>) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, bucket, access_token)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        bucket: impl Into<String>,
        access_token: Option<String>,
    ) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            access_token,
        }
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        authorize(req, self.access_token.as_deref())
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| StorageError::InvalidKey(format!("bad base URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| StorageError::InvalidKey("base URL cannot have a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// JSON API resource URL; the whole key is one encoded path segment.
    pub fn object_url(&self, key: &str) -> Result<Url> {
        validate_key(key)?;
        self.url(&["storage", "v1", "b", &self.bucket, "o", key])
    }

    /// Public download URL; key segments stay separate.
    pub fn public_url(&self, key: &str) -> Result<Url> {
        validate_key(key)?;
        let mut segments = vec![self.bucket.as_str()];
        segments.extend(key.split('/'));
        self.url(&segments)
    }

    async fn get_object(&self, key: &str) -> Result<Option<GcsObject>> {
        let resp = self
            .authorize(self.client.get(self.object_url(key)?))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check(resp).await?;
        Ok(Some(resp.json().await?))
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    fn id(&self) -> &str {
        "gcs"
    }

    fn chunk_alignment(&self) -> usize {
        GCS_CHUNK_ALIGNMENT
    }

    async fn begin_upload(
        &self,
        key: &str,
        content_type: &str,
        total: u64,
    ) -> Result<Box<dyn ObjectWriter>> {
        validate_key(key)?;
        let mut url = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "resumable")
            .append_pair("name", key);

        let resp = self
            .authorize(self.client.post(url))
            .header("X-Upload-Content-Type", content_type)
            .header("X-Upload-Content-Length", total.to_string())
            .json(&serde_json::json!({ "name": key, "contentType": content_type }))
            .send()
            .await?;
        let resp = check(resp).await?;

        let session_uri = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| StorageError::Api {
                status: resp.status().as_u16(),
                message: "resumable upload response had no Location header".into(),
            })?;

        tracing::debug!(key, total, "Opened GCS resumable session");

        Ok(Box::new(GcsResumableWriter {
            client: self.client.clone(),
            access_token: self.access_token.clone(),
            session_uri,
            total,
            offset: 0,
            confirmed: None,
        }))
    }

    async fn metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        Ok(self.get_object(key).await?.map(|obj| ObjectMetadata {
            size: obj.size(),
            content_type: obj
                .content_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        }))
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64> {
        let mut url = self.object_url(key)?;
        url.query_pairs_mut().append_pair("alt", "media");

        let resp = self.authorize(self.client.get(url)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let resp = check(resp).await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    async fn make_public(&self, key: &str) -> Result<String> {
        let mut url = self.object_url(key)?;
        url.path_segments_mut()
            .map_err(|_| StorageError::InvalidKey(key.to_string()))?
            .push("acl");

        let resp = self
            .authorize(self.client.post(url))
            .json(&serde_json::json!({ "entity": "allUsers", "role": "READER" }))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(key.to_string()));
        }
        check(resp).await?;
        Ok(self.public_url(key)?.to_string())
    }
}

/// One resumable upload session.
struct GcsResumableWriter {
    client: Client,
    access_token: Option<String>,
    session_uri: String,
    total: u64,
    offset: u64,
    confirmed: Option<u64>,
}

/// `Content-Range` value for a chunk of `len` bytes at `offset`.
fn content_range(offset: u64, len: u64, total: u64) -> String {
    if len == 0 {
        format!("bytes */{total}")
    } else {
        format!("bytes {offset}-{}/{total}", offset + len - 1)
    }
}

impl GcsResumableWriter {
    async fn put(&mut self, chunk: Bytes) -> Result<()> {
        let len = chunk.len() as u64;
        let resp = authorize(self.client.put(&self.session_uri), self.access_token.as_deref())
            .header(reqwest::header::CONTENT_RANGE, content_range(self.offset, len, self.total))
            .body(chunk)
            .send()
            .await?;

        // 308 means "resume incomplete": the chunk was accepted, more expected.
        if resp.status().as_u16() == 308 {
            self.offset += len;
            return Ok(());
        }
        let resp = check(resp).await?;
        let obj: GcsObject = resp.json().await?;
        self.offset += len;
        self.confirmed = Some(obj.size());
        Ok(())
    }
}

#[async_trait]
impl ObjectWriter for GcsResumableWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.put(chunk).await
    }

    async fn finish(&mut self) -> Result<u64> {
        if self.confirmed.is_none() && self.total == 0 {
            self.put(Bytes::new()).await?;
        }
        self.confirmed.ok_or(StorageError::Incomplete {
            expected: self.total,
            confirmed: self.offset,
        })
    }

    async fn abort(&mut self) {
        if self.confirmed.is_some() {
            return;
        }
        let result = authorize(self.client.delete(&self.session_uri), self.access_token.as_deref())
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!("Failed to cancel GCS resumable session: {e}");
        }
    }
}

fn authorize(req: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => req.bearer_auth(token),
        None => req,
    }
}

/// Turn a non-success response into [`StorageError::Api`].
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or(body);
    Err(StorageError::Api {
        status: status.as_u16(),
        message,
    })
}
