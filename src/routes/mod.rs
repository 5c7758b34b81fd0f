//! HTTP routes for the lookup endpoint

pub mod conf;
pub mod health;

pub use conf::{handle_conf, ConnectionConfig};
pub use health::{health_check, HealthResponse};

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::types::KeygateError;

/// JSON response with permissive CORS
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(body)
        .unwrap_or_else(|_| br#"{"error":"Serialization failed"}"#.to_vec());

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// Error response carrying only a short message. Server-side failures get a
/// generic message; details stay in the logs.
pub fn error_response(err: &KeygateError) -> Response<Full<Bytes>> {
    let status = err.status_code();
    let message = match err {
        KeygateError::BadRequest(m) | KeygateError::Forbidden(m) | KeygateError::NotFound(m) => {
            m.clone()
        }
        _ if status.is_client_error() => err.to_string(),
        _ => "Service temporarily unavailable".to_string(),
    };
    json_response(status, &serde_json::json!({ "error": message }))
}
