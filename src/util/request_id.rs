//! Trace id propagation for outbound calls.

use http::{HeaderMap, HeaderValue};
use uuid::Uuid;

/// Header carrying the trace id.
pub const TRACE_HEADER: &str = "x-request-id";

/// Generate a new UUID-based trace id.
pub fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Return the trace id already in `headers`, inserting a fresh one if absent.
pub fn ensure_trace_id(headers: &mut HeaderMap) -> String {
    if let Some(existing) = headers.get(TRACE_HEADER).and_then(|v| v.to_str().ok()) {
        return existing.to_string();
    }

    let id = generate_trace_id();
    // A hyphenated UUID is always a valid header value.
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(TRACE_HEADER, value);
    }
    id
}
