// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK configuration for talking to a bridge backend.

use std::env;
use std::time::Duration;

use url::Url;

use crate::error::{PairingError, Result};

/// SDK configuration for one backend.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Backend base URL (required)
    pub backend_url: String,
    /// Bearer credential for the backend (required)
    pub credential: String,
    /// Relay endpoint used when the backend cannot be called directly
    pub relay_url: Option<String>,
    /// Bearer token presented to the relay
    pub relay_token: Option<String>,
    /// Host runs on a secure origin; insecure non-loopback backends go through the relay
    pub secure_host: bool,
    /// Health check timeout in milliseconds (default: 5_000)
    pub health_timeout_ms: u64,
    /// Timeout for status, provisioning and connect calls (default: 15_000)
    pub request_timeout_ms: u64,
    /// Timeout for pairing-code fetches (default: 30_000)
    pub qr_timeout_ms: u64,
    /// Polling tick interval (default: 1_000)
    pub poll_interval_ms: u64,
    /// Polling ticks before giving up (default: 150)
    pub max_poll_attempts: u32,
    /// Refresh the displayed code after this long (default: 45_000)
    pub qr_refresh_interval_ms: u64,
    /// Attempt at which one extra refresh is forced (default: 35, 0 disables)
    pub stall_nudge_attempt: u32,
    /// Wait after "start connect" before the first code fetch (default: 1_200)
    pub qr_grace_period_ms: u64,
    /// Code fetch attempts per generation (default: 3)
    pub qr_fetch_attempts: u32,
    /// Delay between code fetch attempts (default: 1_000)
    pub qr_retry_delay_ms: u64,
    /// Connected-session heartbeat interval (default: 0 = disabled)
    pub heartbeat_interval_ms: u64,
    /// Endpoint receiving instance status records
    pub sink_url: Option<String>,
}

impl PairingConfig {
    /// Load configuration from environment variables.
    ///
    /// # Required Environment Variables
    /// - `PAIRBRIDGE_BACKEND_URL` - Backend base URL
    /// - `PAIRBRIDGE_API_KEY` - Bearer credential
    ///
    /// # Optional Environment Variables
    /// - `PAIRBRIDGE_RELAY_URL` / `PAIRBRIDGE_RELAY_TOKEN` - Relay endpoint and token
    /// - `PAIRBRIDGE_SECURE_HOST` - Host is a secure origin (default: false)
    /// - `PAIRBRIDGE_HEALTH_TIMEOUT_MS` (5000), `PAIRBRIDGE_REQUEST_TIMEOUT_MS` (15000),
    ///   `PAIRBRIDGE_QR_TIMEOUT_MS` (30000)
    /// - `PAIRBRIDGE_POLL_INTERVAL_MS` (1000), `PAIRBRIDGE_MAX_POLL_ATTEMPTS` (150)
    /// - `PAIRBRIDGE_QR_REFRESH_MS` (45000), `PAIRBRIDGE_STALL_NUDGE_ATTEMPT` (35)
    /// - `PAIRBRIDGE_QR_GRACE_MS` (1200), `PAIRBRIDGE_QR_RETRY_DELAY_MS` (1000)
    /// - `PAIRBRIDGE_HEARTBEAT_INTERVAL_MS` (0, disabled)
    /// - `PAIRBRIDGE_SINK_URL` - Status sink endpoint
    pub fn from_env() -> Result<Self> {
        let backend_url = env::var("PAIRBRIDGE_BACKEND_URL")
            .map_err(|_| PairingError::Config("PAIRBRIDGE_BACKEND_URL is required".to_string()))?;

        let credential = env::var("PAIRBRIDGE_API_KEY")
            .map_err(|_| PairingError::Config("PAIRBRIDGE_API_KEY is required".to_string()))?;

        let secure_host = env::var("PAIRBRIDGE_SECURE_HOST")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let mut config = Self::new(backend_url, credential);
        config.relay_url = env::var("PAIRBRIDGE_RELAY_URL").ok();
        config.relay_token = env::var("PAIRBRIDGE_RELAY_TOKEN").ok();
        config.secure_host = secure_host;
        config.health_timeout_ms = env_or("PAIRBRIDGE_HEALTH_TIMEOUT_MS", 5_000);
        config.request_timeout_ms = env_or("PAIRBRIDGE_REQUEST_TIMEOUT_MS", 15_000);
        config.qr_timeout_ms = env_or("PAIRBRIDGE_QR_TIMEOUT_MS", 30_000);
        config.poll_interval_ms = env_or("PAIRBRIDGE_POLL_INTERVAL_MS", 1_000);
        config.max_poll_attempts = env_or("PAIRBRIDGE_MAX_POLL_ATTEMPTS", 150);
        config.qr_refresh_interval_ms = env_or("PAIRBRIDGE_QR_REFRESH_MS", 45_000);
        config.stall_nudge_attempt = env_or("PAIRBRIDGE_STALL_NUDGE_ATTEMPT", 35);
        config.qr_grace_period_ms = env_or("PAIRBRIDGE_QR_GRACE_MS", 1_200);
        config.qr_retry_delay_ms = env_or("PAIRBRIDGE_QR_RETRY_DELAY_MS", 1_000);
        config.heartbeat_interval_ms = env_or("PAIRBRIDGE_HEARTBEAT_INTERVAL_MS", 0);
        config.sink_url = env::var("PAIRBRIDGE_SINK_URL").ok();

        config.validate()?;
        Ok(config)
    }

    /// Create a new configuration for the given backend and credential.
    pub fn new(backend_url: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            credential: credential.into(),
            relay_url: None,
            relay_token: None,
            secure_host: false,
            health_timeout_ms: 5_000,
            request_timeout_ms: 15_000,
            qr_timeout_ms: 30_000,
            poll_interval_ms: 1_000,
            max_poll_attempts: 150,
            qr_refresh_interval_ms: 45_000,
            stall_nudge_attempt: 35,
            qr_grace_period_ms: 1_200,
            qr_fetch_attempts: 3,
            qr_retry_delay_ms: 1_000,
            heartbeat_interval_ms: 0,
            sink_url: None,
        }
    }

    /// Check that the backend and relay URLs parse and the numeric limits are usable.
    pub fn validate(&self) -> Result<()> {
        let backend = Url::parse(&self.backend_url).map_err(|e| {
            PairingError::Config(format!("invalid backend URL {}: {}", self.backend_url, e))
        })?;
        if !matches!(backend.scheme(), "http" | "https") {
            return Err(PairingError::Config(format!(
                "backend URL must use http or https, got {}",
                backend.scheme()
            )));
        }
        if let Some(relay) = &self.relay_url {
            Url::parse(relay)
                .map_err(|e| PairingError::Config(format!("invalid relay URL {}: {}", relay, e)))?;
        }
        if self.credential.trim().is_empty() {
            return Err(PairingError::Config("credential must not be empty".to_string()));
        }
        if self.max_poll_attempts == 0 {
            return Err(PairingError::Config(
                "max_poll_attempts must be at least 1".to_string(),
            ));
        }
        if self.qr_fetch_attempts == 0 {
            return Err(PairingError::Config(
                "qr_fetch_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Route calls through the given relay when the transport policy requires it.
    pub fn with_relay(mut self, relay_url: impl Into<String>, token: Option<String>) -> Self {
        self.relay_url = Some(relay_url.into());
        self.relay_token = token;
        self
    }

    /// Mark the host as a secure origin.
    pub fn with_secure_host(mut self, secure: bool) -> Self {
        self.secure_host = secure;
        self
    }

    /// Set the polling tick interval.
    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    /// Set the polling budget.
    pub fn with_max_poll_attempts(mut self, attempts: u32) -> Self {
        self.max_poll_attempts = attempts;
        self
    }

    /// Set the code auto-refresh window.
    pub fn with_qr_refresh_interval_ms(mut self, interval_ms: u64) -> Self {
        self.qr_refresh_interval_ms = interval_ms;
        self
    }

    /// Set the attempt at which a stall nudge refresh is forced (0 disables).
    pub fn with_stall_nudge_attempt(mut self, attempt: u32) -> Self {
        self.stall_nudge_attempt = attempt;
        self
    }

    /// Set the grace period after "start connect" and the delay between code fetches.
    pub fn with_qr_timing(mut self, grace_period_ms: u64, retry_delay_ms: u64) -> Self {
        self.qr_grace_period_ms = grace_period_ms;
        self.qr_retry_delay_ms = retry_delay_ms;
        self
    }

    /// Set the per-call timeouts.
    pub fn with_timeouts(mut self, health_ms: u64, request_ms: u64, qr_ms: u64) -> Self {
        self.health_timeout_ms = health_ms;
        self.request_timeout_ms = request_ms;
        self.qr_timeout_ms = qr_ms;
        self
    }

    /// Set the connected-session heartbeat interval (0 disables).
    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    /// Send status records to the given endpoint.
    pub fn with_sink_url(mut self, url: impl Into<String>) -> Self {
        self.sink_url = Some(url.into());
        self
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn qr_timeout(&self) -> Duration {
        Duration::from_millis(self.qr_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn qr_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.qr_refresh_interval_ms)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
