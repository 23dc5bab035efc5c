//! Pipeline phase events.

use std::sync::Arc;

use tokio::sync::mpsc;

use captioned_types::{PipelineError, PipelineResult, TransferProgress};

/// Observable state of one pipeline run.
///
/// A run reports `Idle`, zero or more `Uploading`, `Generating`, then exactly
/// one of `Succeeded` / `Failed`. `Generating` is skipped when the upload fails.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelinePhase {
    Idle,
    Uploading(TransferProgress),
    Generating,
    Succeeded(Arc<PipelineResult>),
    Failed(PipelineError),
}

impl PipelinePhase {
    pub fn name(&self) -> &'static str {
        match self {
            PipelinePhase::Idle => "idle",
            PipelinePhase::Uploading(_) => "uploading",
            PipelinePhase::Generating => "generating",
            PipelinePhase::Succeeded(_) => "succeeded",
            PipelinePhase::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelinePhase::Succeeded(_) | PipelinePhase::Failed(_))
    }
}

/// Receives phase changes, typically a display.
///
/// Called inline by the controller; implementations must not block.
pub trait PhaseListener: Send + Sync {
    fn on_phase(&self, phase: PipelinePhase);
}

impl PhaseListener for mpsc::UnboundedSender<PipelinePhase> {
    fn on_phase(&self, phase: PipelinePhase) {
        // Receiver gone means nobody is watching.
        let _ = self.send(phase);
    }
}

impl<F> PhaseListener for F
where
    F: Fn(PipelinePhase) + Send + Sync,
{
    fn on_phase(&self, phase: PipelinePhase) {
        self(phase)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_channel_listener() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.on_phase(PipelinePhase::Idle);
        tx.on_phase(PipelinePhase::Generating);
        assert_eq!(rx.try_recv().unwrap(), PipelinePhase::Idle);
        assert_eq!(rx.try_recv().unwrap(), PipelinePhase::Generating);

        drop(rx);
        tx.on_phase(PipelinePhase::Idle);
    }

    #[test]
    fn test_closure_listener() {
        let seen = Mutex::new(Vec::new());
        let listener = |phase: PipelinePhase| seen.lock().unwrap().push(phase.name());
        listener.on_phase(PipelinePhase::Uploading(TransferProgress::new(1, 2)));
        listener.on_phase(PipelinePhase::Failed(PipelineError::Cancelled));
        assert_eq!(*seen.lock().unwrap(), vec!["uploading", "failed"]);
    }

    #[test]
    fn test_terminal() {
        assert!(!PipelinePhase::Generating.is_terminal());
        assert!(PipelinePhase::Failed(PipelineError::Cancelled).is_terminal());
    }
}
