//! Parsing structured output from model text

use serde::de::DeserializeOwned;

use mnemos_core::LLMError;

/// Parse the JSON object embedded in a model reply. Code fences and any prose
/// around the outermost braces are ignored.
pub fn parse_json_reply<T: DeserializeOwned>(text: &str) -> Result<T, LLMError> {
    let trimmed = text.trim();
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');

    let body = match (start, end) {
        (Some(s), Some(e)) if e > s => &trimmed[s..=e],
        _ => {
            return Err(LLMError::Malformed(format!(
                "no JSON object in reply: {}",
                preview(trimmed)
            )));
        }
    };

    serde_json::from_str(body).map_err(LLMError::from)
}

fn preview(text: &str) -> String {
    if text.chars().count() > 80 {
        format!("{}...", text.chars().take(80).collect::<String>())
    } else {
        text.to_string()
    }
}
