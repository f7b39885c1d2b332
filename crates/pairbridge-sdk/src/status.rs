// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status checks and status-shape parsing.
//!
//! Backends report connectivity through differently named fields. A report is
//! considered connected when *any* recognized shape says so.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::backend::{BackendClient, NotFoundKind, Operation, classify_not_found};
use crate::error::{PairingError, Result};
use crate::types::BackendFlavor;

const CONNECTED_FLAGS: &[&str] = &[
    "connected",
    "isConnected",
    "is_connected",
    "loggedIn",
    "logged_in",
    "authenticated",
];

const STATE_FIELDS: &[&str] = &[
    "status",
    "state",
    "connectionState",
    "connection_state",
    "connectionStatus",
    "connection_status",
    "connection",
];

const CONNECTED_STATES: &[&str] = &[
    "connected",
    "open",
    "online",
    "ready",
    "authenticated",
    "logged_in",
    "loggedin",
    "inchat",
];

const PHONE_FIELDS: &[&str] = &["phone", "phoneNumber", "phone_number", "number", "msisdn"];

const IDENTIFIER_FIELDS: &[&str] = &["jid", "wid", "me", "user", "id"];

const NESTED_OBJECTS: &[&str] = &["data", "instance", "session", "result"];

/// Parsed connectivity report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionReport {
    pub connected: bool,
    pub phone_number: Option<String>,
    /// First state string found, for logging
    pub state: Option<String>,
}

impl ConnectionReport {
    pub fn disconnected() -> Self {
        Self::default()
    }
}

/// Parse a status (or code) response body.
pub fn parse_status(body: &Value) -> ConnectionReport {
    let objects = candidate_objects(body);

    let connected_flag = objects.iter().any(|obj| {
        CONNECTED_FLAGS
            .iter()
            .any(|key| obj.get(*key).and_then(Value::as_bool) == Some(true))
    });

    let mut state = None;
    let connected_state = objects.iter().any(|obj| {
        STATE_FIELDS.iter().any(|key| match obj.get(*key) {
            Some(Value::String(s)) => {
                let normalized = s.trim().to_ascii_lowercase();
                if state.is_none() {
                    state = Some(normalized.clone());
                }
                CONNECTED_STATES.contains(&normalized.as_str())
            }
            Some(Value::Bool(true)) if *key == "connection" => true,
            _ => false,
        })
    });

    let phone_number = objects.iter().find_map(|obj| phone_from_object(obj));

    ConnectionReport {
        connected: connected_flag || connected_state,
        phone_number,
        state,
    }
}

fn candidate_objects(body: &Value) -> Vec<&Value> {
    let mut objects = Vec::new();
    if body.is_object() {
        objects.push(body);
        for key in NESTED_OBJECTS {
            if let Some(nested) = body.get(*key).filter(|v| v.is_object()) {
                objects.push(nested);
                for inner in NESTED_OBJECTS {
                    if let Some(deeper) = nested.get(*inner).filter(|v| v.is_object()) {
                        objects.push(deeper);
                    }
                }
            }
        }
    }
    objects
}

fn phone_from_object(obj: &Value) -> Option<String> {
    let direct = PHONE_FIELDS.iter().find_map(|key| match obj.get(*key) {
        Some(Value::String(s)) => normalize_phone(s),
        Some(Value::Number(n)) => normalize_phone(&n.to_string()),
        _ => None,
    });
    direct.or_else(|| {
        IDENTIFIER_FIELDS.iter().find_map(|key| match obj.get(*key) {
            Some(Value::String(s)) => phone_from_identifier(s),
            Some(Value::Object(inner)) => ["id", "jid", "user", "wid"]
                .iter()
                .find_map(|k| inner.get(*k).and_then(Value::as_str))
                .and_then(phone_from_identifier),
            _ => None,
        })
    })
}

fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if (6..=15).contains(&digits.len()) {
        Some(digits)
    } else {
        None
    }
}

/// Extract the phone number from a network identifier such as
/// `5511999999999:12@s.whatsapp.net`.
pub fn phone_from_identifier(identifier: &str) -> Option<String> {
    let (user, _server) = identifier.split_once('@')?;
    let user = user.split(':').next().unwrap_or(user);
    if !user.is_empty() && user.chars().all(|c| c.is_ascii_digit()) {
        normalize_phone(user)
    } else {
        None
    }
}

/// Query the instance status, classifying the backend flavor on the way.
///
/// Network failures and timeouts surface as errors; callers in the polling
/// loop treat them as "not connected yet".
#[instrument(skip(client), fields(backend = %client.descriptor().base_url()))]
pub async fn fetch_status(
    client: &BackendClient,
    instance_id: &str,
    timeout: Duration,
) -> Result<ConnectionReport> {
    let descriptor = client.descriptor();

    if !descriptor.is_legacy() {
        let response = client
            .call_as(
                Operation::Status,
                BackendFlavor::Versioned,
                instance_id,
                None,
                timeout,
            )
            .await?;

        if response.is_success() {
            descriptor.set_flavor(BackendFlavor::Versioned);
            return Ok(parse_status(&response.body));
        }

        if response.is_not_found() {
            match classify_not_found(&response) {
                NotFoundKind::MissingRoute => {
                    descriptor.set_flavor(BackendFlavor::Legacy);
                }
                NotFoundKind::MissingInstance => {
                    descriptor.set_flavor(BackendFlavor::Versioned);
                    debug!(instance_id, "Instance not provisioned yet");
                    return Ok(ConnectionReport::disconnected());
                }
                NotFoundKind::Ambiguous => {
                    descriptor.assume_versioned();
                    return Ok(ConnectionReport::disconnected());
                }
            }
        } else {
            descriptor.assume_versioned();
            warn!(
                instance_id,
                status = response.status,
                message = %response.message(),
                "Status check failed"
            );
            return Err(PairingError::Backend {
                status: response.status,
                message: response.message(),
            });
        }
    }

    let response = client
        .call_as(
            Operation::Status,
            BackendFlavor::Legacy,
            instance_id,
            None,
            timeout,
        )
        .await?;
    if response.is_success() {
        Ok(parse_status(&response.body))
    } else {
        Err(PairingError::Backend {
            status: response.status,
            message: response.message(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_boolean_flag_shapes() {
        assert!(parse_status(&json!({"connected": true})).connected);
        assert!(parse_status(&json!({"isConnected": true})).connected);
        assert!(parse_status(&json!({"data": {"loggedIn": true}})).connected);
        assert!(!parse_status(&json!({"connected": false})).connected);
    }

    #[test]
    fn test_boolean_status_is_not_a_connection_flag() {
        let report = parse_status(&json!({"status": true, "connected": false, "qrcode": "2@x"}));
        assert!(!report.connected);
        assert!(!parse_status(&json!({"status": true})).connected);
        assert!(!parse_status(&json!({"data": {"status": true}})).connected);
    }

    #[test]
    fn test_state_string_shapes() {
        assert!(parse_status(&json!({"status": "CONNECTED"})).connected);
        assert!(parse_status(&json!({"state": "open"})).connected);
        assert!(parse_status(&json!({"instance": {"connectionState": "open"}})).connected);
        assert!(parse_status(&json!({"connection_status": "ready"})).connected);
        let report = parse_status(&json!({"status": "qr_pending"}));
        assert!(!report.connected);
        assert_eq!(report.state.as_deref(), Some("qr_pending"));
    }

    #[test]
    fn test_or_over_disagreeing_fields() {
        let report = parse_status(&json!({"connected": false, "state": "open"}));
        assert!(report.connected);
    }

    #[test]
    fn test_non_object_bodies_are_disconnected() {
        assert!(!parse_status(&json!("connected")).connected);
        assert!(!parse_status(&Value::Null).connected);
    }

    #[test]
    fn test_phone_from_direct_fields() {
        let report = parse_status(&json!({"connected": true, "phone": "+55 (11) 99999-9999"}));
        assert_eq!(report.phone_number.as_deref(), Some("5511999999999"));

        let report = parse_status(&json!({"connected": true, "phoneNumber": 5511988887777u64}));
        assert_eq!(report.phone_number.as_deref(), Some("5511988887777"));
    }

    #[test]
    fn test_phone_from_identifier_fallback() {
        let report = parse_status(&json!({
            "connected": true,
            "user": {"id": "5511999999999:12@s.whatsapp.net"}
        }));
        assert_eq!(report.phone_number.as_deref(), Some("5511999999999"));

        let report = parse_status(&json!({"state": "open", "jid": "447700900123@s.whatsapp.net"}));
        assert_eq!(report.phone_number.as_deref(), Some("447700900123"));
    }

    #[test]
    fn test_instance_id_is_not_a_phone() {
        let report = parse_status(&json!({"connected": true, "id": "inst-1"}));
        assert!(report.phone_number.is_none());
    }

    #[test]
    fn test_phone_from_identifier() {
        assert_eq!(
            phone_from_identifier("5511999999999@c.us").as_deref(),
            Some("5511999999999")
        );
        assert_eq!(phone_from_identifier("abc@s.whatsapp.net"), None);
        assert_eq!(phone_from_identifier("5511999999999"), None);
    }
}
