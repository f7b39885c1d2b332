// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status sinks: where instance status records are persisted.
//!
//! Writes are fire-and-forget from the orchestrator's point of view. A failing
//! sink is logged and never changes the outcome of a pairing run.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::error::{PairingError, Result};
use crate::types::InstanceStatusRecord;

/// Receives instance status records.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn record(&self, record: InstanceStatusRecord) -> Result<()>;
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

#[async_trait]
impl StatusSink for NoopSink {
    async fn record(&self, _record: InstanceStatusRecord) -> Result<()> {
        Ok(())
    }
}

/// Logs every record through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl StatusSink for TracingSink {
    async fn record(&self, record: InstanceStatusRecord) -> Result<()> {
        info!(
            instance_id = %record.instance_id,
            status = record.status.as_str(),
            phone_number = ?record.phone_number,
            heartbeat = record.heartbeat_timestamp.is_some(),
            "Instance status"
        );
        Ok(())
    }
}

/// POSTs each record as JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpStatusSink {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpStatusSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            token,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl StatusSink for HttpStatusSink {
    #[instrument(skip(self, record), fields(instance_id = %record.instance_id, status = record.status.as_str()))]
    async fn record(&self, record: InstanceStatusRecord) -> Result<()> {
        let mut builder = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&record);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| PairingError::Sink(e.to_string()))?;
        if !response.status().is_success() {
            warn!(status = response.status().as_u16(), "Status sink rejected record");
            return Err(PairingError::Sink(format!(
                "sink answered HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}
