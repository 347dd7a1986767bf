use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::value_to_text;

/// A message as returned by the read endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub to: Vec<String>,
    pub from_address: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub status: Option<String>,
    pub raw: Value,
}

impl Message {
    /// Build from an API payload, tolerating the field-name variants the
    /// server uses across versions.
    pub fn from_api(payload: &Value) -> Self {
        let to = match payload.get("to") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items.iter().filter_map(value_to_text).collect(),
            _ => Vec::new(),
        };

        Self {
            id: first_text(payload, &["id", "message_id"]).unwrap_or_default(),
            to,
            from_address: first_text(payload, &["from", "from_address"]),
            subject: first_text(payload, &["subject"]),
            body: first_text(payload, &["body", "plain_body", "text_body"]),
            status: first_text(payload, &["status"]),
            raw: payload.clone(),
        }
    }
}

fn first_text(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .filter_map(value_to_text)
        .find(|s| !s.is_empty())
}
