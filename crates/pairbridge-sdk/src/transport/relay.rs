// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relay transport and the relay wire envelope.
//!
//! The relay takes `{path, method, body}` and answers `{ok, status, data}`,
//! passing the backend's status code and body through untouched so callers can
//! still tell a missing route from a missing instance.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::direct::map_reqwest_error;
use super::{BackendRequest, BackendResponse, HttpMethod, Transport};
use crate::backend::BackendDescriptor;
use crate::error::{PairingError, Result};

/// Request envelope sent to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub path: String,
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Response envelope returned by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub ok: bool,
    pub status: u16,
    #[serde(default)]
    pub data: Value,
}

impl From<RelayResponse> for BackendResponse {
    fn from(envelope: RelayResponse) -> Self {
        BackendResponse::new(envelope.status, envelope.data)
    }
}

/// Sends backend calls through a relay endpoint.
#[derive(Debug, Clone)]
pub struct RelayTransport {
    client: reqwest::Client,
    relay_url: String,
    token: Option<String>,
}

impl RelayTransport {
    pub fn new(client: reqwest::Client, relay_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            relay_url: relay_url.into(),
            token,
        }
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn name(&self) -> &'static str {
        "relay"
    }

    #[instrument(skip(self, _descriptor, request), fields(method = %request.method, path = %request.path))]
    async fn send(
        &self,
        _descriptor: &BackendDescriptor,
        request: &BackendRequest,
    ) -> Result<BackendResponse> {
        let envelope = RelayRequest {
            path: request.path.clone(),
            method: request.method,
            body: request.body.clone(),
        };

        let mut builder = self
            .client
            .post(&self.relay_url)
            .timeout(request.timeout)
            .json(&envelope);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, request))?;
        let relay_status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, request))?;

        match serde_json::from_str::<RelayResponse>(&text) {
            Ok(envelope) => {
                debug!(
                    relay_status = relay_status.as_u16(),
                    backend_status = envelope.status,
                    "Relay answered"
                );
                Ok(envelope.into())
            }
            Err(e) => {
                warn!(
                    relay_status = relay_status.as_u16(),
                    error = %e,
                    "Relay answered without an envelope"
                );
                if relay_status.is_server_error() {
                    // 5xx without an envelope: the relay could not reach the backend
                    Err(PairingError::Transport(format!(
                        "relay could not reach backend (HTTP {})",
                        relay_status.as_u16()
                    )))
                } else {
                    Err(PairingError::Relay(format!(
                        "unexpected relay response (HTTP {})",
                        relay_status.as_u16()
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_relay_request_wire_shape() {
        let request = RelayRequest {
            path: "/api/instances".into(),
            method: HttpMethod::Post,
            body: Some(json!({"instanceId": "a", "name": "A"})),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"path": "/api/instances", "method": "POST", "body": {"instanceId": "a", "name": "A"}})
        );

        let get = RelayRequest {
            path: "/status".into(),
            method: HttpMethod::Get,
            body: None,
        };
        assert_eq!(
            serde_json::to_value(&get).unwrap(),
            json!({"path": "/status", "method": "GET"})
        );
    }

    #[test]
    fn test_relay_response_keeps_backend_status() {
        let envelope: RelayResponse = serde_json::from_value(json!({
            "ok": false,
            "status": 404,
            "data": "Cannot GET /api/instance/x/status"
        }))
        .unwrap();
        let response: BackendResponse = envelope.into();
        assert_eq!(response.status, 404);
        assert!(response.body_text().contains("cannot get"));
    }
}
