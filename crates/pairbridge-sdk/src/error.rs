// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the pairing orchestrator.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while pairing a device against a bridge backend.
#[derive(Debug, Error)]
pub enum PairingError {
    /// Configuration error (missing or invalid environment variable)
    #[error("configuration error: {0}")]
    Config(String),

    /// The backend rejected the credential during the health check
    #[error("backend rejected the API key (HTTP {status}); check the configured credential")]
    Unauthorized {
        /// HTTP status returned by the backend (401 or 403)
        status: u16,
    },

    /// The backend process could not be reached at all
    #[error("backend is unreachable at {url}; make sure the bridge service is running ({reason})")]
    Unreachable {
        /// Backend base URL
        url: String,
        /// Underlying network failure
        reason: String,
    },

    /// The health endpoint answered with an unexpected status
    #[error("backend health check failed with HTTP {status}")]
    HealthCheck {
        /// HTTP status returned by the backend
        status: u16,
    },

    /// Instance creation was rejected for a reason other than "already exists"
    #[error("failed to provision instance: {0}")]
    Provision(String),

    /// A pairing code could not be obtained or rendered
    #[error("failed to generate pairing code: {0}")]
    QrGeneration(String),

    /// Polling budget exhausted without the device connecting
    #[error("timeout: pairing code was not scanned after {attempts} attempts")]
    Timeout {
        /// Number of polling ticks that elapsed
        attempts: u32,
    },

    /// An individual backend call exceeded its deadline
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Network-level failure talking to the backend or relay
    #[error("transport error: {0}")]
    Transport(String),

    /// The relay answered with something that is not a relay envelope
    #[error("relay error: {0}")]
    Relay(String),

    /// Backend answered with an error status for an operation that has no
    /// dedicated recovery path
    #[error("backend error: HTTP {status} - {message}")]
    Backend {
        /// HTTP status returned by the backend
        status: u16,
        /// Message extracted from the response body
        message: String,
    },

    /// Status sink could not persist a record
    #[error("status sink error: {0}")]
    Sink(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The run was stopped before it finished
    #[error("pairing cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for PairingError {
    fn from(err: serde_json::Error) -> Self {
        PairingError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for PairingError {
    fn from(err: url::ParseError) -> Self {
        PairingError::Config(format!("invalid URL: {}", err))
    }
}

impl PairingError {
    /// Whether the error came from the network layer rather than a backend answer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PairingError::Transport(_) | PairingError::RequestTimeout(_) | PairingError::Relay(_)
        )
    }
}

/// Type alias for pairing results.
pub type Result<T> = std::result::Result<T, PairingError>;
