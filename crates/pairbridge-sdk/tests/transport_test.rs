// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Routing between the direct and relay transports.

use std::time::Duration;

use pairbridge_sdk::{
    BackendClient, NotFoundKind, Operation, PairingConfig, PairingError, Route,
    classify_not_found, fetch_status,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(1);

fn relayed_config(relay: &MockServer) -> PairingConfig {
    PairingConfig::new("http://203.0.113.7:3000", "backend-key")
        .with_secure_host(true)
        .with_relay(format!("{}/relay", relay.uri()), Some("relay-token".into()))
}

#[tokio::test]
async fn test_secure_host_relays_remote_http_backend() {
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/relay"))
        .and(header("authorization", "Bearer relay-token"))
        .and(body_json(json!({"path": "/api/instance/inst-1/status", "method": "GET"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "status": 200,
            "data": {"connected": true, "phone": "5511999999999"}
        })))
        .expect(1)
        .mount(&relay)
        .await;

    let client = BackendClient::from_config(&relayed_config(&relay)).unwrap();
    assert_eq!(client.route(), Route::Relayed);

    let report = fetch_status(&client, "inst-1", TIMEOUT).await.unwrap();
    assert!(report.connected);
    assert_eq!(report.phone_number.as_deref(), Some("5511999999999"));
}

#[tokio::test]
async fn test_relay_passes_backend_404_through() {
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/relay"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": false,
            "status": 404,
            "data": {"error": "Instance not found"}
        })))
        .mount(&relay)
        .await;

    let client = BackendClient::from_config(&relayed_config(&relay)).unwrap();
    let response = client
        .call(Operation::Status, "inst-1", None, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(classify_not_found(&response), NotFoundKind::MissingInstance);
}

#[tokio::test]
async fn test_relay_without_envelope_is_an_error() {
    let relay = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/relay"))
        .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
        .mount(&relay)
        .await;

    let client = BackendClient::from_config(&relayed_config(&relay)).unwrap();
    let err = client
        .call(Operation::Health, "", None, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, PairingError::Transport(_)), "{:?}", err);
}

#[tokio::test]
async fn test_loopback_backend_is_called_directly() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .and(header("authorization", "Bearer backend-key"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&backend)
        .await;

    // Secure host, but the backend is on loopback.
    let config = PairingConfig::new(backend.uri(), "backend-key")
        .with_secure_host(true)
        .with_relay("http://relay.invalid/relay", None);
    let client = BackendClient::from_config(&config).unwrap();
    assert_eq!(client.route(), Route::Direct);

    let response = client
        .call(Operation::Health, "", None, TIMEOUT)
        .await
        .unwrap();
    assert!(response.is_success());
}

#[tokio::test]
async fn test_missing_relay_is_a_config_error() {
    let config = PairingConfig::new("http://203.0.113.7:3000", "backend-key").with_secure_host(true);
    let client = BackendClient::from_config(&config).unwrap();
    let err = client
        .call(Operation::Health, "", None, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, PairingError::Config(_)));
}
