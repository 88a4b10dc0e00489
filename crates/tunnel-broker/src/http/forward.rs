//! `ANY /forward/*path` - the public dispatch entry point.
//!
//! The incoming request is wrapped into an opaque envelope
//! `{method, path, query, headers, body}` and dispatched to a worker. A reply
//! object carrying `status_code` is replayed as that HTTP response; any other
//! payload is returned as a 200 JSON body.

use crate::domain::{DispatchError, RequestId, TargetSelector, WorkerId, WorkerReply};
use crate::http::{
    AppState, REQUEST_ID_HEADER, RESPONSE_TIME_HEADER, TIMEOUT_HEADER, WORKER_HEADER,
};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Request headers never forwarded to workers
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    WORKER_HEADER,
    TIMEOUT_HEADER,
];

/// Reply headers the broker computes itself
const STRIPPED_REPLY_HEADERS: &[&str] = &["content-length", "connection", "transfer-encoding"];

/// Forward a public request through a worker
pub async fn forward(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    let response = match prepare(&method, &uri, &headers, &body) {
        Ok((selector, timeout, payload)) => {
            match state.gateway.dispatch(&selector, payload, timeout).await {
                Ok(dispatched) => {
                    debug!(
                        request_id = %dispatched.request_id,
                        worker_id = %dispatched.worker_id,
                        elapsed_ms = dispatched.elapsed.as_millis() as u64,
                        "Forwarded request answered"
                    );
                    let mut response = reply_response(dispatched.reply, dispatched.request_id);
                    set_request_id(&mut response, dispatched.request_id);
                    response
                }
                Err(e) => dispatch_error_response(&e),
            }
        }
        Err(message) => error_response(StatusCode::BAD_REQUEST, "bad_request", &message, None),
    };

    with_response_time(response, started)
}

type Prepared = (TargetSelector, Option<Duration>, Value);

fn prepare(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Prepared, String> {
    let selector = target_selector(headers);
    let timeout = requested_timeout(headers)?;
    let query = Query::<Vec<(String, String)>>::try_from_uri(uri)
        .map(|Query(query)| query)
        .map_err(|e| format!("invalid query string: {}", e))?;

    let payload = build_envelope(method, forwarded_path(uri.path()), &query, headers, body);
    Ok((selector, timeout, payload))
}

/// Resolve `X-Tunnel-Worker` into a target selector
pub fn target_selector(headers: &HeaderMap) -> TargetSelector {
    match headers.get(WORKER_HEADER).and_then(|v| v.to_str().ok()).map(str::trim) {
        None | Some("") | Some("any") => TargetSelector::Any,
        Some("latest") => TargetSelector::MostRecent,
        Some(id) => TargetSelector::Worker(WorkerId::from(id)),
    }
}

/// Parse `X-Tunnel-Timeout-Ms`
pub fn requested_timeout(headers: &HeaderMap) -> Result<Option<Duration>, String> {
    let Some(raw) = headers.get(TIMEOUT_HEADER) else {
        return Ok(None);
    };

    let ms: u64 = raw
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| format!("{} must be a positive integer", TIMEOUT_HEADER))?;

    if ms == 0 {
        return Err(format!("{} must be a positive integer", TIMEOUT_HEADER));
    }
    Ok(Some(Duration::from_millis(ms)))
}

/// Path below the `/forward` prefix
pub fn forwarded_path(path: &str) -> &str {
    match path.strip_prefix("/forward") {
        Some("") | None => "/",
        Some(rest) => rest,
    }
}

/// Wrap a request into the opaque payload sent to the worker
pub fn build_envelope(
    method: &Method,
    path: &str,
    query: &[(String, String)],
    headers: &HeaderMap,
    body: &[u8],
) -> Value {
    let forwarded: Map<String, Value> = headers
        .iter()
        .filter(|(name, _)| !STRIPPED_REQUEST_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
        })
        .collect();

    json!({
        "method": method.as_str(),
        "path": path,
        "query": query_object(query),
        "headers": forwarded,
        "body": decode_body(body),
    })
}

/// Query pairs as an object. A key given once maps to its string, a
/// repeated key to the array of its values in order.
fn query_object(pairs: &[(String, String)]) -> Map<String, Value> {
    let mut object = Map::new();
    for (key, value) in pairs {
        let value = Value::String(value.clone());
        match object.get_mut(key) {
            None => {
                object.insert(key.clone(), value);
            }
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
        }
    }
    object
}

/// JSON when the body parses, text otherwise, null when empty
fn decode_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Map a worker reply onto an HTTP response
pub fn reply_response(reply: WorkerReply, request_id: RequestId) -> Response {
    match reply {
        WorkerReply::Payload(Value::Object(map)) if map.contains_key("status_code") => {
            http_reply(map, request_id)
        }
        WorkerReply::Payload(other) => (StatusCode::OK, Json(other)).into_response(),
        WorkerReply::Failed(message) => error_response(
            StatusCode::BAD_GATEWAY,
            "worker_error",
            &message,
            Some(request_id),
        ),
    }
}

fn http_reply(mut map: Map<String, Value>, request_id: RequestId) -> Response {
    let status = map
        .get("status_code")
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .and_then(|code| StatusCode::from_u16(code).ok());

    let Some(status) = status else {
        return error_response(
            StatusCode::BAD_GATEWAY,
            "invalid_reply",
            "worker reply carries an invalid status_code",
            Some(request_id),
        );
    };

    let mut response = match map.remove("body") {
        None | Some(Value::Null) => status.into_response(),
        Some(Value::String(text)) => (status, text).into_response(),
        Some(other) => (status, Json(other)).into_response(),
    };

    if let Some(Value::Object(headers)) = map.remove("headers") {
        for (name, value) in headers {
            let Some(value) = value.as_str() else {
                continue;
            };
            if STRIPPED_REPLY_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }
    }

    response
}

/// HTTP status for a dispatch failure
pub fn status_for(error: &DispatchError) -> StatusCode {
    match error {
        DispatchError::NoWorkerAvailable => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::Overloaded => StatusCode::TOO_MANY_REQUESTS,
        DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::WorkerDisconnected { .. } => StatusCode::BAD_GATEWAY,
    }
}

fn dispatch_error_response(error: &DispatchError) -> Response {
    error_response(
        status_for(error),
        error.code(),
        &error.to_string(),
        error.request_id(),
    )
}

fn error_response(
    status: StatusCode,
    kind: &str,
    message: &str,
    request_id: Option<RequestId>,
) -> Response {
    let body = json!({
        "error": kind,
        "message": message,
        "request_id": request_id,
    });
    let mut response = (status, Json(body)).into_response();
    if let Some(request_id) = request_id {
        set_request_id(&mut response, request_id);
    }
    response
}

fn set_request_id(response: &mut Response, request_id: RequestId) {
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
}

fn with_response_time(mut response: Response, started: Instant) -> Response {
    let elapsed = format!("{}ms", started.elapsed().as_millis());
    if let Ok(value) = HeaderValue::from_str(&elapsed) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(RESPONSE_TIME_HEADER), value);
    }
    response
}
