//! Interpreting the model's content-only reply as a round decision.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};

/// Notes kept from a reply that could not be read as a decision.
pub const COERCED_NOTES_LIMIT: usize = 2000;

pub const ROUND_TRIPS_EXHAUSTED: &str =
    "Exceeded max tool round-trips without producing a decision.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Decision {
    Continue {
        #[serde(default, deserialize_with = "text_or_lines")]
        notes: String,
    },
    Done {
        #[serde(default, deserialize_with = "text_or_lines")]
        notes: String,
    },
    NeedsHuman {
        #[serde(default, deserialize_with = "text_or_lines")]
        admin_steps: String,
        #[serde(default, deserialize_with = "text_or_lines")]
        notes: String,
    },
    Error {
        #[serde(default, deserialize_with = "text_or_lines")]
        error: String,
    },
}

impl Decision {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Continue { .. } => "continue",
            Self::Done { .. } => "done",
            Self::NeedsHuman { .. } => "needs_human",
            Self::Error { .. } => "error",
        }
    }
}

/// A decision plus the JSON object it was read from, kept for the run log.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDecision {
    pub decision: Decision,
    pub raw: Value,
}

impl ModelDecision {
    pub fn error(message: &str) -> Self {
        Self {
            decision: Decision::Error {
                error: message.to_string(),
            },
            raw: json!({ "status": "error", "error": message }),
        }
    }
}

/// Read a decision from reply text.
///
/// Accepts a bare JSON object or one embedded in prose (the outermost `{...}`).
/// Anything else, including an unknown status, becomes `continue` with the
/// text preserved in `notes`.
pub fn parse_decision(content: &str) -> ModelDecision {
    if let Some(raw) = salvage_json_object(content)
        && raw.get("status").and_then(Value::as_str).is_some()
        && let Ok(decision) = serde_json::from_value::<Decision>(raw.clone())
    {
        return ModelDecision { decision, raw };
    }

    let notes: String = content.chars().take(COERCED_NOTES_LIMIT).collect();
    ModelDecision {
        raw: json!({ "status": "continue", "notes": notes, "coerced": true }),
        decision: Decision::Continue { notes },
    }
}

fn salvage_json_object(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Accept a string, a list of strings (joined by newlines) or null.
fn text_or_lines<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => String::new(),
        Value::String(text) => text,
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    })
}
