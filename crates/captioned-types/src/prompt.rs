//! Captioning instructions sent to the generative model.

use crate::MediaKind;

/// Build the captioning prompt for a media kind.
///
/// The model is asked for JSON matching [`crate::CaptionPayload`]: one caption
/// per style, each with emojis and hashtags.
pub fn captions_prompt(kind: MediaKind) -> String {
    let noun = kind.noun();
    format!(
        r#"Write three captions for the attached {noun}, each in a different style.
Base every caption on what the {noun} actually shows and include fitting emojis and hashtags in each one.
Answer with JSON only: an object holding an array of captions.

1. Minimalist: short and concise.
2. Short sentence: one brief sentence describing the {noun}.
3. Detailed: a longer, more descriptive caption.

Use exactly this structure:
{{
    "captions": [
        {{ "type": "minimalist", "caption": "<caption with emojis and hashtags>" }},
        {{ "type": "short_sentence", "caption": "<caption with emojis and hashtags>" }},
        {{ "type": "detailed", "caption": "<caption with emojis and hashtags>" }}
    ]
}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_mentions_media_noun() {
        let photo = captions_prompt(MediaKind::Photo);
        assert!(photo.contains("attached image"));
        assert!(!photo.contains("video"));

        let video = captions_prompt(MediaKind::Video);
        assert!(video.contains("attached video"));
    }

    #[test]
    fn test_prompt_lists_all_styles() {
        let prompt = captions_prompt(MediaKind::Photo);
        for style in ["\"minimalist\"", "\"short_sentence\"", "\"detailed\""] {
            assert!(prompt.contains(style), "missing {style}");
        }
    }
}
