//! Readiness polling for submitted files.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use captioned_types::{PipelineError, RemoteFileHandle, RemoteFileState};

use crate::types::GenerativeService;

/// Shortest wait between two state checks.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Result of inspecting one observed file state.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Ready(RemoteFileHandle),
    Failed(RemoteFileHandle),
    Pending,
}

/// Map an observed handle to the next polling step.
pub fn classify(handle: RemoteFileHandle) -> PollOutcome {
    match handle.state {
        RemoteFileState::Active => PollOutcome::Ready(handle),
        RemoteFileState::Failed => PollOutcome::Failed(handle),
        RemoteFileState::Processing => PollOutcome::Pending,
    }
}

/// Waits for a submitted file to leave the processing state.
///
/// Checks immediately, then every `interval` (never less than
/// [`MIN_POLL_INTERVAL`]), and gives up once `deadline` has elapsed since
/// the first check.
#[derive(Debug, Clone)]
pub struct ReadinessPoller {
    interval: Duration,
    deadline: Duration,
}

impl ReadinessPoller {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval: interval.max(MIN_POLL_INTERVAL),
            deadline,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub async fn await_ready(
        &self,
        service: &dyn GenerativeService,
        remote_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteFileHandle, PipelineError> {
        let started = Instant::now();
        let give_up_at = started + self.deadline;
        let mut checks = 0u32;

        loop {
            checks += 1;
            let observed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                r = tokio::time::timeout_at(give_up_at, service.get_file(remote_id)) => r,
            };

            let handle = match observed {
                Err(_) => return Err(self.deadline_exceeded(remote_id)),
                Ok(Err(e)) => {
                    return Err(PipelineError::ProcessingFailed(format!(
                        "failed to query state of {remote_id}: {e:#}"
                    )));
                }
                Ok(Ok(handle)) => handle,
            };

            match classify(handle) {
                PollOutcome::Ready(handle) => {
                    info!(
                        remote_id,
                        checks,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Remote file is ready"
                    );
                    return Ok(handle);
                }
                PollOutcome::Failed(handle) => {
                    return Err(PipelineError::ProcessingFailed(format!(
                        "{} failed to process",
                        handle.remote_id
                    )));
                }
                PollOutcome::Pending => {}
            }

            let now = Instant::now();
            if now >= give_up_at {
                return Err(self.deadline_exceeded(remote_id));
            }
            debug!(remote_id, checks, "Remote file still processing");

            let wake = (now + self.interval).min(give_up_at);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    fn deadline_exceeded(&self, remote_id: &str) -> PipelineError {
        PipelineError::ProcessingFailed(format!(
            "{remote_id} still processing after {}s",
            self.deadline.as_secs()
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Replays a scripted sequence of states; the last one repeats.
    struct ScriptedService {
        states: Mutex<Vec<RemoteFileState>>,
        calls: AtomicU32,
        fail_lookup: bool,
    }

    impl ScriptedService {
        fn new(states: Vec<RemoteFileState>) -> Self {
            Self {
                states: Mutex::new(states),
                calls: AtomicU32::new(0),
                fail_lookup: false,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerativeService for ScriptedService {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn submit_file(
            &self,
            _path: &Path,
            _mime_type: &str,
            _display_name: &str,
        ) -> anyhow::Result<RemoteFileHandle> {
            unreachable!()
        }

        async fn get_file(&self, remote_id: &str) -> anyhow::Result<RemoteFileHandle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_lookup {
                anyhow::bail!("lookup refused");
            }
            let mut states = self.states.lock().unwrap();
            let state = if states.len() > 1 {
                states.remove(0)
            } else {
                states[0]
            };
            Ok(RemoteFileHandle {
                remote_id: remote_id.to_string(),
                mime_type: "video/mp4".into(),
                uri: format!("https://files.example/{remote_id}"),
                state,
            })
        }

        async fn generate(&self, _prompt: &str, _file: &RemoteFileHandle) -> anyhow::Result<String> {
            unreachable!()
        }

        async fn delete_file(&self, _remote_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn poller() -> ReadinessPoller {
        ReadinessPoller::new(Duration::from_secs(10), Duration::from_secs(300))
    }

    #[test]
    fn test_classify() {
        let mut handle = RemoteFileHandle {
            remote_id: "files/a".into(),
            mime_type: "image/png".into(),
            uri: "u".into(),
            state: RemoteFileState::Processing,
        };
        assert_eq!(classify(handle.clone()), PollOutcome::Pending);
        handle.state = RemoteFileState::Active;
        assert!(matches!(classify(handle.clone()), PollOutcome::Ready(_)));
        handle.state = RemoteFileState::Failed;
        assert!(matches!(classify(handle), PollOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_immediately() {
        let service = ScriptedService::new(vec![RemoteFileState::Active]);
        let started = Instant::now();
        let handle = poller()
            .await_ready(&service, "files/a", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handle.state, RemoteFileState::Active);
        assert_eq!(service.calls(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_processing() {
        // Two processing observations before the file turns active.
        let service = ScriptedService::new(vec![
            RemoteFileState::Processing,
            RemoteFileState::Processing,
            RemoteFileState::Active,
        ]);
        let started = Instant::now();
        let handle = poller()
            .await_ready(&service, "files/v", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handle.remote_id, "files/v");
        assert_eq!(service.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let service = ScriptedService::new(vec![
            RemoteFileState::Processing,
            RemoteFileState::Processing,
            RemoteFileState::Active,
        ]);
        let poller = ReadinessPoller::new(Duration::ZERO, Duration::from_secs(300));
        assert_eq!(poller.interval(), MIN_POLL_INTERVAL);

        let started = Instant::now();
        poller
            .await_ready(&service, "files/z", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(service.calls(), 3);
        assert_eq!(started.elapsed(), MIN_POLL_INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_state() {
        let service =
            ScriptedService::new(vec![RemoteFileState::Processing, RemoteFileState::Failed]);
        let err = poller()
            .await_ready(&service, "files/f", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ProcessingFailed(_)));
        assert_eq!(service.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let service = ScriptedService::new(vec![RemoteFileState::Processing]);
        let poller = ReadinessPoller::new(Duration::from_secs(10), Duration::from_secs(35));
        let started = Instant::now();
        let err = poller
            .await_ready(&service, "files/slow", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ProcessingFailed(ref m) if m.contains("35s")));
        // Checks at 0, 10, 20, 30 and a final one at 35.
        assert_eq!(service.calls(), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(35));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_error() {
        let mut service = ScriptedService::new(vec![RemoteFileState::Active]);
        service.fail_lookup = true;
        let err = poller()
            .await_ready(&service, "files/x", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ProcessingFailed(ref m) if m.contains("lookup refused")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting() {
        let service = ScriptedService::new(vec![RemoteFileState::Processing]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            trigger.cancel();
        });

        let err = poller()
            .await_ready(&service, "files/c", &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::Cancelled);
        assert_eq!(service.calls(), 2);
    }
}
