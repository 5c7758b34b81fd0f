//! Liveness check

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::json_response;
use crate::hosts::free_slots;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    pub hosts: usize,
    #[serde(rename = "freeSlots")]
    pub free_slots: u64,
    pub timestamp: String,
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Always 200 while the process runs; registry trouble is reported in the body
pub async fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    let (hosts, free, error) = match state.coordinator.registry().load().await {
        Ok(hosts) => (hosts.len(), free_slots(&hosts), None),
        Err(e) => (0, 0, Some(e.to_string())),
    };

    let response = HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        hosts,
        free_slots: free,
        timestamp: Utc::now().to_rfc3339(),
        mode: if state.args.dev_mode { "development" } else { "production" },
        error,
    };

    json_response(StatusCode::OK, &response)
}
