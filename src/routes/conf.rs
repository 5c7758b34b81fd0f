//! Dynamic key resolution
//!
//! `GET /conf/{encrypted_id}` turns the identifier embedded in a dynamic key
//! into the user's current connection parameters.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use super::{error_response, json_response};
use crate::server::AppState;
use crate::types::{KeygateError, Result};

/// Connection parameters in the shape VPN clients expect
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub server: String,
    pub server_port: u16,
    pub password: String,
    pub method: String,
    pub prefix: String,
}

pub async fn handle_conf(state: &AppState, encrypted_id: &str) -> Response<Full<Bytes>> {
    match resolve(state, encrypted_id, Utc::now()).await {
        Ok(config) => json_response(StatusCode::OK, &config),
        Err(e) => {
            if e.status_code().is_server_error() {
                warn!(error = %e, "Lookup failed");
            }
            error_response(&e)
        }
    }
}

async fn resolve(state: &AppState, encrypted_id: &str, now: DateTime<Utc>) -> Result<ConnectionConfig> {
    // Some clients percent-encode the base64 padding
    let token = encrypted_id.replace("%3D", "=").replace("%3d", "=");

    let user_id = state
        .coordinator
        .dynamic_keys()
        .cipher()
        .decrypt_user_id(&token)
        .map_err(|e| {
            debug!(error = %e, "Undecryptable identifier");
            KeygateError::BadRequest("Invalid identifier".into())
        })?;

    let user = state
        .coordinator
        .users()
        .get(user_id)
        .await?
        .ok_or_else(|| KeygateError::NotFound("User not found".into()))?;

    if !user.has_access(now) {
        return Err(KeygateError::Forbidden("No active subscription".into()));
    }

    let key = user
        .key
        .ok_or_else(|| KeygateError::NotFound("No key issued".into()))?;

    Ok(ConnectionConfig {
        server: key.host,
        server_port: key.port,
        password: key.password,
        method: key.method,
        prefix: state.args.lookup_prefix.clone(),
    })
}
