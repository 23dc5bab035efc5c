//! Test doubles shared by the orchestrator and server tests.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use captioned_media::types::GenerativeService;
use captioned_types::{RemoteFileHandle, RemoteFileState};

pub const CAPTIONS: &str = r#"{"captions":[
    {"type":"minimalist","caption":"Latte art ☕ #coffee"},
    {"type":"short_sentence","caption":"A perfect heart in my latte ☕ #cafe"},
    {"type":"detailed","caption":"Foam poured into a delicate heart on a rainy afternoon ☕🌧️ #latteart #cafelife"}
]}"#;

/// Generative service double. States replay in order; the last repeats.
pub struct FakeService {
    pub states: Mutex<Vec<RemoteFileState>>,
    pub response: String,
    pub submitted: Mutex<Vec<(PathBuf, String, Vec<u8>)>>,
    pub prompts: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub reject_submit: bool,
    pub fail_generate: bool,
    /// `delete_file` records the id and then never completes.
    pub hang_delete: bool,
}

impl FakeService {
    pub fn new(states: Vec<RemoteFileState>, response: &str) -> Self {
        Self {
            states: Mutex::new(states),
            response: response.to_string(),
            submitted: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            reject_submit: false,
            fail_generate: false,
            hang_delete: false,
        }
    }
}

#[async_trait]
impl GenerativeService for FakeService {
    fn id(&self) -> &str {
        "fake"
    }

    async fn submit_file(
        &self,
        path: &Path,
        mime_type: &str,
        _display_name: &str,
    ) -> anyhow::Result<RemoteFileHandle> {
        if self.reject_submit {
            anyhow::bail!("quota exceeded");
        }
        let data = std::fs::read(path)?;
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push((path.to_path_buf(), mime_type.to_string(), data));
        Ok(RemoteFileHandle {
            remote_id: format!("files/{}", submitted.len()),
            mime_type: mime_type.to_string(),
            uri: format!("https://files.example/{}", submitted.len()),
            state: RemoteFileState::Processing,
        })
    }

    async fn get_file(&self, remote_id: &str) -> anyhow::Result<RemoteFileHandle> {
        let mut states = self.states.lock().unwrap();
        let state = if states.len() > 1 {
            states.remove(0)
        } else {
            states[0]
        };
        Ok(RemoteFileHandle {
            remote_id: remote_id.to_string(),
            mime_type: "image/jpeg".into(),
            uri: "https://files.example/x".into(),
            state,
        })
    }

    async fn generate(&self, prompt: &str, file: &RemoteFileHandle) -> anyhow::Result<String> {
        assert_eq!(file.state, RemoteFileState::Active);
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.fail_generate {
            anyhow::bail!("model overloaded");
        }
        Ok(self.response.clone())
    }

    async fn delete_file(&self, remote_id: &str) -> anyhow::Result<()> {
        self.deleted.lock().unwrap().push(remote_id.to_string());
        if self.hang_delete {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}
