//! In-container agent protocol.
//!
//! The agent is a single executable invoked as `<agent> <keyword> KEY=VALUE...`.
//! It prints one JSON object, possibly surrounded by banners or log noise.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const KEYWORD_SAVE: &str = "save";
pub const KEYWORD_COPY_DOCS: &str = "copy-docs";

#[derive(Debug, Error)]
pub enum AgentParseError {
    #[error("agent output contains no JSON object")]
    NoJsonObject,

    #[error("agent output is not valid JSON: {source}")]
    Malformed {
        #[source]
        source: serde_json::Error,
    },
}

/// Result of a command run inside a session container.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandOutput {
    Raw(String),
    Json(Value),
}

impl CommandOutput {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            CommandOutput::Json(value) => Some(value),
            CommandOutput::Raw(_) => None,
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            CommandOutput::Raw(text) => text.clone(),
            CommandOutput::Json(value) => value.to_string(),
        }
    }
}

/// Parse the text between the first `{` and the last `}`.
pub fn extract_json_object(output: &str) -> Result<Value, AgentParseError> {
    let start = output.find('{').ok_or(AgentParseError::NoJsonObject)?;
    let end = output.rfind('}').ok_or(AgentParseError::NoJsonObject)?;
    if end < start {
        return Err(AgentParseError::NoJsonObject);
    }

    serde_json::from_str(&output[start..=end])
        .map_err(|source| AgentParseError::Malformed { source })
}

/// Agent output reduced to JSON; unparseable output becomes `{"error": raw}`.
pub fn reduce_output(output: &str) -> (Value, Option<AgentParseError>) {
    match extract_json_object(output) {
        Ok(value) => (value, None),
        Err(err) => (serde_json::json!({ "error": output }), Some(err)),
    }
}

/// argv for one agent call.
pub fn agent_argv(agent_path: &str, keyword: &str, args: &[(String, String)]) -> Vec<String> {
    let mut argv = Vec::with_capacity(args.len() + 2);
    argv.push(agent_path.to_string());
    argv.push(keyword.to_string());
    argv.extend(args.iter().map(|(k, v)| format!("{}={}", k, v)));
    argv
}

/// Pull the `body` field out of a `{"body": ...}` envelope.
pub fn envelope_body(value: &Value) -> Option<String> {
    match value.get("body")? {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
