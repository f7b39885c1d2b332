// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! High-level types for the SDK.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PairingError;

/// API shape exposed by a bridge backend deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendFlavor {
    /// Not probed yet
    #[default]
    Unknown,
    /// Single implicit instance, routes without an instance id
    Legacy,
    /// Multi-instance, routes scoped by `/api/instance/{id}`
    Versioned,
}

impl BackendFlavor {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            BackendFlavor::Unknown => 0,
            BackendFlavor::Legacy => 1,
            BackendFlavor::Versioned => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => BackendFlavor::Legacy,
            2 => BackendFlavor::Versioned,
            _ => BackendFlavor::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendFlavor::Unknown => "unknown",
            BackendFlavor::Legacy => "legacy",
            BackendFlavor::Versioned => "versioned",
        }
    }
}

/// Snapshot of one pairing run, suitable for rendering a single status view.
///
/// A terminal failure always has the shape
/// `is_connecting == false, is_polling == false, qr_code == None, error == Some(..)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    /// Handshake (health, status, provisioning, code generation) in progress
    pub is_connecting: bool,
    /// A code is displayed and the status loop is active
    pub is_polling: bool,
    /// Currently displayed pairing code as an image data URI
    pub qr_code: Option<String>,
    /// Terminal failure message
    pub error: Option<String>,
    /// Polling ticks elapsed since the code was first issued. Refreshing the
    /// code does not reset it, so the attempt ceiling bounds the whole run.
    pub attempts: u32,
}

impl ConnectionState {
    /// Returns true when the run stopped with an error.
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of a pairing-code request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingResult {
    /// The backend reports the device is already paired
    AlreadyConnected {
        /// Phone number of the paired account, when reported
        phone_number: Option<String>,
    },
    /// A displayable pairing code (image data URI)
    Code(String),
}

/// Result of the pre-flight health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Any 2xx response
    Healthy,
    /// 401 or 403: the credential is wrong
    Unauthorized { status: u16 },
    /// Network failure or timeout: the process is not running
    Unreachable { reason: String },
    /// Any other status
    Errored { status: u16 },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Convert into the error surfaced to the caller.
    pub fn into_result(self, backend_url: &str) -> Result<(), PairingError> {
        match self {
            HealthStatus::Healthy => Ok(()),
            HealthStatus::Unauthorized { status } => Err(PairingError::Unauthorized { status }),
            HealthStatus::Unreachable { reason } => Err(PairingError::Unreachable {
                url: backend_url.to_string(),
                reason,
            }),
            HealthStatus::Errored { status } => Err(PairingError::HealthCheck { status }),
        }
    }
}

/// Outcome of [`crate::InstanceProvisioner::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionOutcome {
    /// The instance exists on the backend (possibly created just now)
    pub exists: bool,
    /// This call created the instance
    pub created: bool,
}

/// Instance status written to the persistence sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Device paired and session live
    Connected,
    /// No live session
    Disconnected,
    /// Pairing code issued, waiting for scan
    QrPending,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Connected => "connected",
            InstanceStatus::Disconnected => "disconnected",
            InstanceStatus::QrPending => "qr_pending",
        }
    }
}

/// Record persisted after connected or terminal transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatusRecord {
    pub instance_id: String,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_timestamp: Option<DateTime<Utc>>,
}

impl InstanceStatusRecord {
    pub fn new(instance_id: impl Into<String>, status: InstanceStatus) -> Self {
        Self {
            instance_id: instance_id.into(),
            status,
            phone_number: None,
            last_seen: Utc::now(),
            heartbeat_timestamp: None,
        }
    }

    pub fn with_phone_number(mut self, phone_number: Option<String>) -> Self {
        self.phone_number = phone_number;
        self
    }

    pub fn with_heartbeat(mut self) -> Self {
        self.heartbeat_timestamp = Some(self.last_seen);
        self
    }
}

/// Delivered once through the completion channel when pairing succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedDevice {
    pub instance_id: String,
    pub phone_number: Option<String>,
    pub connected_at: DateTime<Utc>,
}
