//! captioned-pipeline: client-side caption pipeline.
//!
//! Uploads a captured file, asks a [`CaptionService`] for captions, publishes
//! the result and reports phases to a display listener.
//!
//! [`CaptionService`]: captioned_types::CaptionService

pub mod controller;
pub mod events;
pub mod remote;
pub mod result_store;

pub use controller::PipelineController;
pub use events::{PhaseListener, PipelinePhase};
pub use remote::HttpCaptionClient;
pub use result_store::{ResultReader, ResultStore};
