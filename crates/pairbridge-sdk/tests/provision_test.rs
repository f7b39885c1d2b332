// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance provisioning against mock backends of both flavors.

mod common;

use std::time::Duration;

use pairbridge_sdk::{
    BackendClient, BackendFlavor, InstanceProvisioner, PairingError, ProvisionOutcome,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::fast_config;

fn provisioner(server: &MockServer) -> (InstanceProvisioner, BackendClient) {
    let client = BackendClient::from_config(&fast_config(&server.uri())).unwrap();
    (
        InstanceProvisioner::new(client.clone(), Duration::from_secs(1)),
        client,
    )
}

const EXISTS: ProvisionOutcome = ProvisionOutcome {
    exists: true,
    created: false,
};

#[tokio::test]
async fn test_existing_versioned_instance() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/instance/inst-1/status"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "disconnected"})))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/instances"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let (provisioner, client) = provisioner(&server);
    assert_eq!(provisioner.ensure("inst-1", "Store 1").await.unwrap(), EXISTS);
    assert_eq!(provisioner.ensure("inst-1", "Store 1").await.unwrap(), EXISTS);
    assert_eq!(client.descriptor().flavor(), BackendFlavor::Versioned);
}

#[tokio::test]
async fn test_missing_instance_is_created_once_then_exists() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/instance/inst-1/status"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"error": "Instance not found"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/instances"))
        .and(body_json(json!({"instanceId": "inst-1", "name": "Store 1"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "inst-1"})))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/instances"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"error": "conflict"})))
        .with_priority(2)
        .mount(&server)
        .await;

    let (provisioner, client) = provisioner(&server);
    assert_eq!(
        provisioner.ensure("inst-1", "Store 1").await.unwrap(),
        ProvisionOutcome {
            exists: true,
            created: true
        }
    );
    // A concurrent creator won the race: still a success.
    assert_eq!(provisioner.ensure("inst-1", "Store 1").await.unwrap(), EXISTS);
    assert_eq!(client.descriptor().flavor(), BackendFlavor::Versioned);
}

#[tokio::test]
async fn test_already_exists_message_is_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/instance/inst-1/status"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"error": "Instance not found"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/instances"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"error": "Instance inst-1 already exists"})),
        )
        .mount(&server)
        .await;

    let (provisioner, _) = provisioner(&server);
    assert_eq!(provisioner.ensure("inst-1", "Store 1").await.unwrap(), EXISTS);
}

#[tokio::test]
async fn test_legacy_backend_is_detected_and_sticky() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/instance/inst-1/status"))
        .respond_with(
            ResponseTemplate::new(404).set_body_string("Cannot GET /api/instance/inst-1/status"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/instances"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let (provisioner, client) = provisioner(&server);
    assert_eq!(provisioner.ensure("inst-1", "Store 1").await.unwrap(), EXISTS);
    assert_eq!(client.descriptor().flavor(), BackendFlavor::Legacy);

    // Legacy: no further probes.
    assert_eq!(provisioner.ensure("inst-1", "Store 1").await.unwrap(), EXISTS);
    assert_eq!(provisioner.ensure("other", "Other").await.unwrap(), EXISTS);
}

#[tokio::test]
async fn test_ambiguous_404_assumes_versioned_and_creates() {
    let server = MockServer::start().await;
    // Unmatched requests get an empty 404: no signature either way.
    Mock::given(method("POST"))
        .and(path("/api/instances"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let (provisioner, client) = provisioner(&server);
    let outcome = provisioner.ensure("inst-1", "Store 1").await.unwrap();
    assert!(outcome.created);
    assert_eq!(client.descriptor().flavor(), BackendFlavor::Versioned);
}

#[tokio::test]
async fn test_rejected_creation_is_provision_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/instance/inst-1/status"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"error": "Instance not found"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/instances"))
        .respond_with(
            ResponseTemplate::new(500).set_body_json(json!({"message": "disk full"})),
        )
        .mount(&server)
        .await;

    let (provisioner, _) = provisioner(&server);
    let err = provisioner.ensure("inst-1", "Store 1").await.unwrap_err();
    match err {
        PairingError::Provision(message) => {
            assert!(message.contains("500"), "{}", message);
            assert!(message.contains("disk full"), "{}", message);
        }
        other => panic!("expected provision error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_probe_server_error_continues_optimistically() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/instance/inst-1/status"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/instances"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let (provisioner, client) = provisioner(&server);
    assert_eq!(provisioner.ensure("inst-1", "Store 1").await.unwrap(), EXISTS);
    assert_eq!(client.descriptor().flavor(), BackendFlavor::Versioned);
}
