//! Decoding model output into a [`CaptionSet`].

use captioned_types::{CaptionPayload, CaptionSet, PipelineError};

/// Parse the model's structured response.
///
/// Accepts the bare JSON object or one wrapped in a markdown code fence.
/// Anything that is not exactly one caption per style is
/// [`PipelineError::MalformedResponse`].
pub fn parse_captions(text: &str) -> Result<CaptionSet, PipelineError> {
    let body = strip_code_fence(text.trim());
    let payload: CaptionPayload = serde_json::from_str(body).map_err(|e| {
        PipelineError::MalformedResponse(format!("response is not caption JSON: {e}"))
    })?;
    CaptionSet::new(payload.captions)
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_end()
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}
