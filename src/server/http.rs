//! HTTP server for the lookup endpoint
//!
//! hyper http1 with TokioIo, one task per connection.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::Args;
use crate::routes;
use crate::services::KeyLifecycleCoordinator;
use crate::types::KeygateError;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub coordinator: Arc<KeyLifecycleCoordinator>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(args: Args, coordinator: Arc<KeyLifecycleCoordinator>) -> Self {
        Self {
            args,
            coordinator,
            started_at: Instant::now(),
        }
    }
}

/// Serve the lookup endpoint until the process exits
pub async fn run(state: Arc<AppState>) -> Result<(), KeygateError> {
    let listener = TcpListener::bind(state.args.listen)
        .await
        .map_err(|e| KeygateError::Config(format!("Failed to bind {}: {}", state.args.listen, e)))?;

    info!("Keygate lookup endpoint listening on {}", state.args.listen);

    if state.args.dev_mode {
        warn!("Development mode enabled - using in-memory user records");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    Ok(route(&state, &method, &path).await)
}

/// Dispatch a request by method and path
pub async fn route(state: &AppState, method: &Method, path: &str) -> Response<Full<Bytes>> {
    if method == Method::OPTIONS {
        return preflight_response();
    }

    match (method, path) {
        (&Method::GET, "/health" | "/healthz") => routes::health_check(state).await,
        (&Method::GET, p) if p.starts_with("/conf/") => {
            let encrypted_id = &p["/conf/".len()..];
            if encrypted_id.is_empty() || encrypted_id.contains('/') {
                return not_found_response(path);
            }
            routes::handle_conf(state, encrypted_id).await
        }
        _ => not_found_response(path),
    }
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, OPTIONS"));
    response
}

fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    routes::json_response(
        StatusCode::NOT_FOUND,
        &serde_json::json!({ "error": "Not Found", "path": path }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{KeyBinding, UserDoc};
    use crate::services::coordinator::tests::{host, Harness};
    use chrono::{Duration, Utc};
    use clap::Parser;
    use http_body_util::BodyExt;
    use serde_json::Value;

    fn args() -> Args {
        Args::try_parse_from(["keygate", "--dev-mode"]).unwrap()
    }

    fn user(id: i64, subscription_days: i64, bound: bool) -> UserDoc {
        let mut user = UserDoc::new(id, None);
        user.subscription_end = Some(bson::DateTime::from_chrono(
            Utc::now() + Duration::days(subscription_days),
        ));
        if bound {
            user.key = Some(KeyBinding {
                host: "h1.example.net".into(),
                key_id: "3".into(),
                port: 51234,
                password: "pw".into(),
                method: "chacha20-ietf-poly1305".into(),
                access_url: "ss://x".into(),
            });
        }
        user
    }

    async fn get(state: &AppState, path: &str) -> (StatusCode, Value) {
        let response = route(state, &Method::GET, path).await;
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn token(h: &Harness, id: i64) -> String {
        h.coordinator
            .dynamic_keys()
            .cipher()
            .encrypt_user_id(id)
            .unwrap()
    }

    #[tokio::test]
    async fn test_conf_returns_connection_parameters() {
        let h = Harness::new(&[host("h1.example.net", 1, 5)]).await;
        h.users.insert(user(802171486, 30, true));
        let state = AppState::new(args(), Arc::clone(&h.coordinator));

        let (status, body) = get(&state, &format!("/conf/{}", token(&h, 802171486))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server"], "h1.example.net");
        assert_eq!(body["server_port"], 51234);
        assert_eq!(body["password"], "pw");
        assert_eq!(body["method"], "chacha20-ietf-poly1305");
        assert_eq!(body["prefix"], "%13%03%03%3F");
    }

    #[tokio::test]
    async fn test_conf_accepts_encoded_padding() {
        let h = Harness::new(&[host("h1.example.net", 1, 5)]).await;
        h.users.insert(user(123456789, 30, true));
        let state = AppState::new(args(), Arc::clone(&h.coordinator));

        let encoded = token(&h, 123456789).replace('=', "%3D");
        let (status, _) = get(&state, &format!("/conf/{}", encoded)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_conf_error_statuses() {
        let h = Harness::new(&[host("h1.example.net", 1, 5)]).await;
        h.users.insert(user(1, -1, true));
        h.users.insert(user(2, 30, false));
        let state = AppState::new(args(), Arc::clone(&h.coordinator));

        let (status, body) = get(&state, "/conf/garbage!!").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid identifier");

        let (status, _) = get(&state, &format!("/conf/{}", token(&h, 99))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get(&state, &format!("/conf/{}", token(&h, 1))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = get(&state, &format!("/conf/{}", token(&h, 2))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_fallbacks() {
        let h = Harness::new(&[host("h1", 1, 5), host("h2", 3, 3)]).await;
        let state = AppState::new(args(), Arc::clone(&h.coordinator));

        let (status, body) = get(&state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hosts"], 2);
        assert_eq!(body["freeSlots"], 4);

        let (status, _) = get(&state, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(&state, "/conf/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let preflight = route(&state, &Method::OPTIONS, "/conf/x").await;
        assert_eq!(preflight.status(), StatusCode::OK);
        assert_eq!(
            preflight.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            HeaderValue::from_static("*")
        );
    }
}
