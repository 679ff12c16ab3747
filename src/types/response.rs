use serde::Serialize;
use std::collections::HashMap;

/// Response handed back through the pipeline.
///
/// Bodies are JSON values; transports that receive non-JSON payloads wrap them in a
/// JSON string.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
}

impl Response {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body,
        }
    }

    /// A `200 OK` response with a JSON body.
    pub fn ok(body: serde_json::Value) -> Self {
        Self::new(200, body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Same status and headers, different body. Used when fanning a batch out.
    pub(crate) fn with_body(&self, body: serde_json::Value) -> Self {
        Self {
            status: self.status,
            headers: self.headers.clone(),
            body,
        }
    }
}
