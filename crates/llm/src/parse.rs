use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// All four extraction strategies failed to produce valid JSON.
#[derive(Debug, thiserror::Error)]
#[error("no valid JSON found in response (first 200 chars: {preview})")]
pub struct JsonExtractError {
    pub preview: String,
}

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?si)```(?:json)?\s*(.*?)```").expect("fenced-block pattern is valid")
});

static BRACE_SLICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("brace-slice pattern is valid"));

/// Parse JSON out of a model response that may wrap it in prose.
///
/// Models routinely fence their JSON in markdown or prepend explanations, so
/// parsing walks a ladder of strategies:
///
/// 1. direct parse (fast path for well-formed responses)
/// 2. fenced markdown block (```json … ``` or ``` … ```)
/// 3. greedy first-`{`-to-last-`}` slice
/// 4. trimmed preamble/postamble around the outermost braces
pub fn parse_json_response(response: &str) -> Result<Value, JsonExtractError> {
    if let Ok(value) = serde_json::from_str(response) {
        return Ok(value);
    }

    if let Some(caps) = FENCED_BLOCK.captures(response) {
        if let Ok(value) = serde_json::from_str(caps[1].trim()) {
            return Ok(value);
        }
    }

    if let Some(found) = BRACE_SLICE.find(response) {
        if let Ok(value) = serde_json::from_str(found.as_str()) {
            return Ok(value);
        }
    }

    let cleaned = response.trim();
    if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) {
        if end > start {
            if let Ok(value) = serde_json::from_str(&cleaned[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(JsonExtractError {
        preview: response.chars().take(200).collect(),
    })
}

/// Typed variant of [`parse_json_response`].
pub fn parse_json_as<T: serde::de::DeserializeOwned>(response: &str) -> Result<T, JsonExtractError> {
    let value = parse_json_response(response)?;
    serde_json::from_value(value).map_err(|_| JsonExtractError {
        preview: response.chars().take(200).collect(),
    })
}
