//! Parsing of LLM classification responses.
//!
//! Models wrap JSON in fences or prose, emit smart quotes and leave trailing
//! commas. The object is extracted and repaired before strict validation:
//! the category must belong to the configured set (or be `unknown`) and the
//! confidence must be a JSON number within `[0, 1]`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::classifier::ClassificationResult;
use crate::config::UNKNOWN_CATEGORY;
use crate::error::ClassifierError;

static TRAILING_COMMA: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").ok());

/// Parse a raw model response into a validated result.
pub fn parse_classification(
    raw: &str,
    categories: &[String],
    provider: &str,
) -> Result<ClassificationResult, ClassifierError> {
    let malformed = |reason: String| ClassifierError::Malformed {
        provider: provider.to_string(),
        reason,
    };

    if raw.trim().is_empty() {
        return Err(malformed("empty response".into()));
    }

    let json = repair_json(&extract_json_object(raw));
    let value: Value =
        serde_json::from_str(&json).map_err(|e| malformed(format!("JSON parse error: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("response is not a JSON object".into()))?;

    let category = obj
        .get("category")
        .and_then(Value::as_str)
        .map(|c| c.trim().to_lowercase())
        .ok_or_else(|| malformed("missing string field 'category'".into()))?;
    if category != UNKNOWN_CATEGORY && !categories.iter().any(|c| c.eq_ignore_ascii_case(&category)) {
        return Err(malformed(format!("category '{category}' is not configured")));
    }

    let confidence = obj
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| malformed("missing numeric field 'confidence'".into()))?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(malformed(format!("confidence {confidence} is outside [0, 1]")));
    }

    let reason = obj
        .get("reason")
        .or_else(|| obj.get("reasoning"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    Ok(ClassificationResult::new(category, confidence as f32, provider).with_rationale(reason))
}

/// Extract a JSON object from text that may carry markdown fences or prose.
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

/// Replace typographic quotes and drop trailing commas.
pub fn repair_json(json: &str) -> String {
    let straightened: String = json
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect();
    match TRAILING_COMMA.as_ref() {
        Some(re) => re.replace_all(&straightened, "$1").into_owned(),
        None => straightened,
    }
}
