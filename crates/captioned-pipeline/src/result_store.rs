//! Process-wide holder of the latest pipeline result.

use std::sync::{Arc, RwLock};

use captioned_types::PipelineResult;

type Slot = Arc<RwLock<Option<Arc<PipelineResult>>>>;

/// Latest successful result. Clones share the same slot.
///
/// Results are replaced whole, so readers never observe a mix of two runs.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    slot: Slot,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current result.
    pub(crate) fn set(&self, result: PipelineResult) -> Arc<PipelineResult> {
        let result = Arc::new(result);
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = Some(result.clone());
        result
    }

    pub fn get(&self) -> Option<Arc<PipelineResult>> {
        read(&self.slot)
    }

    pub fn reset(&self) {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Read-only view for display collaborators.
    pub fn reader(&self) -> ResultReader {
        ResultReader {
            slot: self.slot.clone(),
        }
    }
}

/// Read-only handle onto a [`ResultStore`].
#[derive(Debug, Clone)]
pub struct ResultReader {
    slot: Slot,
}

impl ResultReader {
    pub fn get(&self) -> Option<Arc<PipelineResult>> {
        read(&self.slot)
    }
}

fn read(slot: &Slot) -> Option<Arc<PipelineResult>> {
    slot.read().unwrap_or_else(|e| e.into_inner()).clone()
}
