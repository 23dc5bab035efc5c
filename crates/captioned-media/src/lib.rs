//! captioned-media: generative service access. File staging, readiness
//! polling, caption generation and response parsing.

pub mod captions;
pub mod gemini;
pub mod poller;
pub mod types;
