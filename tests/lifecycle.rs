//! End-to-end key lifecycle against a mocked key-management API

use clap::Parser;
use http_body_util::BodyExt;
use hyper::{Method, StatusCode};
use keygate::config::Args;
use keygate::db::{KeyRef, MemoryUserStore, UserStore};
use keygate::hosts::{Host, HostRegistry};
use keygate::server::{route, AppState};
use keygate::services::{DynamicKeyBuilder, IdCipher, KeyLifecycleCoordinator, OutlineClient};
use keygate::KeygateError;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Setup {
    _dir: TempDir,
    registry: Arc<HostRegistry>,
    users: MemoryUserStore,
    coordinator: Arc<KeyLifecycleCoordinator>,
}

async fn setup(server: &MockServer, hosts: Vec<(&str, u32, u32)>) -> Setup {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(HostRegistry::new(dir.path().join("hosts.json")));
    let hosts: Vec<Host> = hosts
        .into_iter()
        .map(|(id, current, max)| Host {
            host: id.to_string(),
            api_url: format!("{}/{}", server.uri(), id),
            current_devices: current,
            max_devices: max,
        })
        .collect();
    registry.save(&hosts).await.unwrap();

    let users = MemoryUserStore::new();
    let cipher = IdCipher::aes_ecb(b"0123456789abcdef").unwrap();
    let coordinator = Arc::new(KeyLifecycleCoordinator::new(
        Arc::clone(&registry),
        Arc::new(OutlineClient::new(Duration::from_secs(2)).unwrap()),
        Arc::new(users.clone()),
        Arc::new(DynamicKeyBuilder::new("vpn.example.com", "VPN", cipher)),
    ));

    Setup {
        _dir: dir,
        registry,
        users,
        coordinator,
    }
}

async fn devices(registry: &HostRegistry, host: &str) -> u32 {
    registry.find(host).await.unwrap().unwrap().current_devices
}

#[tokio::test]
async fn grant_lookup_revoke() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/h2/access-keys"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": 17,
            "name": "123456789",
            "password": "hunter2",
            "port": 40017,
            "method": "chacha20-ietf-poly1305",
            "accessUrl": "ss://Y2hhY2hh@h2:40017/?outline=1"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/h2/access-keys/17"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let s = setup(&server, vec![("h1", 5, 5), ("h2", 1, 3)]).await;
    s.users.ensure_user(123456789, Some("alice")).await.unwrap();
    s.coordinator.activate_trial(123456789).await.unwrap();

    // The trial key points at h2
    let user = s.users.get(123456789).await.unwrap().unwrap();
    let key = user.key.clone().unwrap();
    assert_eq!(key.host, "h2");
    assert_eq!(key.key_id, "17");
    assert_eq!(
        user.dynamic_key.as_deref(),
        Some("ssconf://vpn.example.com/conf/Bpz_J8xGf_0jfh1SpvzpuA==#VPN")
    );
    assert_eq!(devices(&s.registry, "h1").await, 5);
    assert_eq!(devices(&s.registry, "h2").await, 2);

    // The lookup endpoint resolves the dynamic key
    let args = Args::try_parse_from(["keygate", "--dev-mode"]).unwrap();
    let state = AppState::new(args, Arc::clone(&s.coordinator));
    let response = route(&state, &Method::GET, "/conf/Bpz_J8xGf_0jfh1SpvzpuA==").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["server"], "h2");
    assert_eq!(body["server_port"], 40017);
    assert_eq!(body["password"], "hunter2");

    // Revoke, then revoke again
    let key_ref = KeyRef::new("h2", "17");
    assert!(s.coordinator.revoke(&key_ref).await);
    assert!(s.users.get(123456789).await.unwrap().unwrap().key.is_none());
    assert_eq!(devices(&s.registry, "h2").await, 1);

    assert!(!s.coordinator.revoke(&key_ref).await);
    assert_eq!(devices(&s.registry, "h2").await, 1);

    let response = route(&state, &Method::GET, "/conf/Bpz_J8xGf_0jfh1SpvzpuA==").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn remote_failure_leaves_no_trace() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/h1/access-keys"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let s = setup(&server, vec![("h1", 0, 3)]).await;
    s.users.ensure_user(7, None).await.unwrap();
    let before = s.users.get(7).await.unwrap();

    let err = s.coordinator.provision(7).await.unwrap_err();
    assert!(matches!(err, KeygateError::RemoteRejected(503)));
    assert!(err.is_transient());
    assert_eq!(s.users.get(7).await.unwrap(), before);
    assert_eq!(devices(&s.registry, "h1").await, 0);
}

#[tokio::test]
async fn refused_delete_keeps_key_for_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/h1/access-keys"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": "4",
            "password": "pw",
            "port": 1234,
            "method": "aes-256-gcm",
            "accessUrl": "ss://x"
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/h1/access-keys/4"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let s = setup(&server, vec![("h1", 0, 3)]).await;
    s.users.ensure_user(7, None).await.unwrap();
    s.coordinator.provision(7).await.unwrap();

    assert!(!s.coordinator.revoke(&KeyRef::new("h1", "4")).await);
    assert!(s.users.get(7).await.unwrap().unwrap().key.is_some());
    assert_eq!(devices(&s.registry, "h1").await, 1);
}
