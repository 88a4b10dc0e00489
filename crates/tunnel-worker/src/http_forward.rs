//! Replays forwarded HTTP envelopes against a local service.
//!
//! Request envelope (built by the broker's `/forward` endpoint):
//!
//! ```json
//! {"method": "POST", "path": "/hooks", "query": {"k": "v"}, "headers": {...}, "body": ...}
//! ```
//!
//! Reply envelope, which the broker turns back into an HTTP response:
//!
//! ```json
//! {"status_code": 200, "headers": {...}, "body": ...}
//! ```

use crate::client::RequestHandler;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;
use tunnel_broker::RequestId;

const HOP_BY_HOP: &[&str] = &["connection", "content-length", "host", "transfer-encoding"];

/// A parsed request envelope
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRequest {
    pub method: Method,
    pub path: String,
    /// Query pairs in order; repeated keys appear once per value
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl LocalRequest {
    /// Parse a broker envelope. Missing fields fall back to `GET /`.
    pub fn from_envelope(envelope: &Value) -> Result<Self, String> {
        let Value::Object(map) = envelope else {
            return Err("request envelope must be a JSON object".into());
        };

        let method = match map.get("method").and_then(Value::as_str) {
            Some(m) => Method::from_bytes(m.as_bytes()).map_err(|_| format!("bad method: {m}"))?,
            None => Method::GET,
        };

        let path = match map.get("path").and_then(Value::as_str) {
            Some(p) if p.starts_with('/') => p.to_string(),
            Some(p) => format!("/{p}"),
            None => "/".to_string(),
        };

        Ok(Self {
            method,
            path,
            query: query_pairs(map.get("query")),
            headers: string_map(map.get("headers"))
                .into_iter()
                .filter(|(name, _)| !HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()))
                .collect(),
            body: map.get("body").cloned().unwrap_or(Value::Null),
        })
    }
}

/// Flatten `{"k": "v", "r": ["1", "2"]}` into pairs, one per value
fn query_pairs(value: Option<&Value>) -> Vec<(String, String)> {
    let Some(Value::Object(map)) = value else {
        return Vec::new();
    };
    let mut pairs = Vec::new();
    for (key, value) in map {
        match value {
            Value::String(v) => pairs.push((key.clone(), v.clone())),
            Value::Array(values) => pairs.extend(
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|v| (key.clone(), v.to_string())),
            ),
            _ => {}
        }
    }
    pairs
}

fn string_map(value: Option<&Value>) -> Vec<(String, String)> {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect(),
        _ => Vec::new(),
    }
}

/// Forwards every request to `base_url` over HTTP
pub struct HttpForwardHandler {
    client: reqwest::Client,
    base_url: String,
}

impl HttpForwardHandler {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn replay(&self, request: LocalRequest) -> Result<Value, reqwest::Error> {
        let mut builder = self
            .client
            .request(request.method, self.url_for(&request.path))
            .query(&request.query);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match request.body {
            Value::Null => builder,
            Value::String(text) => builder.body(text),
            other => builder.json(&other),
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
            })
            .collect();
        let body = response.bytes().await?;

        Ok(json!({
            "status_code": status,
            "headers": headers,
            "body": decode_body(&body),
        }))
    }
}

/// JSON when the body parses, text otherwise, null when empty
fn decode_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

#[async_trait]
impl RequestHandler for HttpForwardHandler {
    async fn handle(&self, request_id: RequestId, payload: Value) -> Result<Value, String> {
        let request = LocalRequest::from_envelope(&payload)?;
        debug!(
            request_id = %request_id,
            method = %request.method,
            path = %request.path,
            "Replaying request locally"
        );
        self.replay(request).await.map_err(|e| e.to_string())
    }
}
