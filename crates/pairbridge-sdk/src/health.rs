// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pre-flight health validation.

use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::backend::{BackendClient, Operation};
use crate::types::HealthStatus;

/// Bounded reachability and credential check run before pairing.
#[derive(Clone)]
pub struct HealthValidator {
    client: BackendClient,
    timeout: Duration,
}

impl HealthValidator {
    pub fn new(client: BackendClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Probe `GET /health`.
    ///
    /// Any 2xx is healthy regardless of body shape. 401/403 means the
    /// credential is wrong; a network failure or timeout means the backend
    /// process is not running.
    #[instrument(skip(self), fields(backend = %self.client.descriptor().base_url()))]
    pub async fn check(&self) -> HealthStatus {
        // The path does not depend on flavor or instance.
        let result = tokio::time::timeout(
            self.timeout,
            self.client
                .call(Operation::Health, "", None, self.timeout),
        )
        .await;

        let status = match result {
            Err(_) => HealthStatus::Unreachable {
                reason: format!("no answer within {:?}", self.timeout),
            },
            Ok(Err(e)) => HealthStatus::Unreachable {
                reason: e.to_string(),
            },
            Ok(Ok(response)) if response.is_success() => HealthStatus::Healthy,
            Ok(Ok(response)) if response.status == 401 || response.status == 403 => {
                HealthStatus::Unauthorized {
                    status: response.status,
                }
            }
            Ok(Ok(response)) => HealthStatus::Errored {
                status: response.status,
            },
        };

        if status.is_healthy() {
            info!("Backend healthy");
        } else {
            warn!(status = ?status, "Backend health check failed");
        }
        status
    }
}
