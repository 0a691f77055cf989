//! The two HTTP listeners: the data plane serving files and scripts, and
//! the control plane for invalidation and introspection.

pub mod control_service;
pub mod file_service;

use axum::body::Body;
use axum::http::Response;

/// Build a response from a status, replayable headers and a body.
pub(crate) fn response_with_headers(
    status: u16,
    headers: &[(String, String)],
    body: Vec<u8>,
) -> Response<Body> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(Body::from(body)).unwrap_or_default()
}

/// Build a bare response.
pub(crate) fn bytes_response(status: u16, body: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap_or_default()
}

/// Build a JSON response the way the control plane serves them.
pub(crate) fn json_response(status: u16, value: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json; charset=utf-8")
        .body(Body::from(value.to_string()))
        .unwrap_or_default()
}

/// Replace-or-append a header pair in a plain header list.
pub(crate) fn set_pair(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    if let Some(slot) = headers
        .iter_mut()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
    {
        slot.1 = value.to_string();
    } else {
        headers.push((name.to_string(), value.to_string()));
    }
}
