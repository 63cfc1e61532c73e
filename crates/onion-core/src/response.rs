//! Layered responses

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::NEXT_NODE_NOT_FOUND_PREFIX;
use crate::NodeKey;

/// Body of a destination response, decoded once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    Empty,
    Text(String),
    Json(Value),
}

impl ResponseBody {
    /// JSON when the text parses as JSON, raw text otherwise
    pub fn decode(text: &str) -> Self {
        if text.trim().is_empty() {
            return ResponseBody::Empty;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(text.to_string()),
        }
    }

    /// Envelope bodies are either a JSON string (itself possibly JSON) or inline JSON
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => ResponseBody::Empty,
            Value::String(s) => Self::decode(&s),
            other => ResponseBody::Json(other),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ResponseBody::Empty)
    }

    /// Lossy string form for error reporting
    pub fn to_text(&self) -> String {
        match self {
            ResponseBody::Empty => String::new(),
            ResponseBody::Text(s) => s.clone(),
            ResponseBody::Json(v) => v.to_string(),
        }
    }
}

/// Raw `{status, body}` as returned by the guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnodeResponse {
    pub status: u16,
    pub body: String,
}

impl SnodeResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Key of the hop a relay could not reach, if the body says so
    pub fn next_node_not_found(&self) -> Option<NodeKey> {
        let lower = self.body.to_ascii_lowercase();
        let prefix = NEXT_NODE_NOT_FOUND_PREFIX.to_ascii_lowercase();
        let start = lower.find(&prefix)? + prefix.len();
        let rest = self.body[start..].trim();
        let hex: String = rest.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
        NodeKey::from_hex(&hex).ok()
    }
}
