// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance provisioning.
//!
//! Versioned backends host many instances and need an explicit creation call
//! before a code can be requested. Legacy backends have a single implicit
//! instance. Provisioning is idempotent: concurrent or repeated calls for the
//! same instance never fail each other.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendClient, NotFoundKind, Operation, classify_not_found};
use crate::error::{PairingError, Result};
use crate::transport::BackendResponse;
use crate::types::{BackendFlavor, ProvisionOutcome};

const ALREADY_EXISTS_SIGNATURES: &[&str] = &["already exists", "already exist", "duplicate"];

/// Makes sure an instance record exists on the backend.
#[derive(Clone)]
pub struct InstanceProvisioner {
    client: BackendClient,
    timeout: Duration,
}

impl InstanceProvisioner {
    pub fn new(client: BackendClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Ensure `instance_id` exists, creating it with `name` when missing.
    ///
    /// Fails with [`PairingError::Provision`] only when a creation request is
    /// rejected for a reason other than "already exists".
    #[instrument(skip(self), fields(backend = %self.client.descriptor().base_url()))]
    pub async fn ensure(&self, instance_id: &str, name: &str) -> Result<ProvisionOutcome> {
        let descriptor = self.client.descriptor();
        if descriptor.is_legacy() {
            debug!("Legacy backend, single implicit instance");
            return Ok(ProvisionOutcome {
                exists: true,
                created: false,
            });
        }

        let probe = self
            .client
            .call_as(
                Operation::Status,
                BackendFlavor::Versioned,
                instance_id,
                None,
                self.timeout,
            )
            .await;

        let response = match probe {
            Ok(response) => response,
            Err(e) => {
                // Could not probe; optimistically assume the instance is there and
                // let code generation surface a real failure.
                descriptor.assume_versioned();
                warn!(error = %e, "Instance probe failed, continuing");
                return Ok(ProvisionOutcome {
                    exists: true,
                    created: false,
                });
            }
        };

        if response.is_success() {
            descriptor.set_flavor(BackendFlavor::Versioned);
            return Ok(ProvisionOutcome {
                exists: true,
                created: false,
            });
        }

        if !response.is_not_found() {
            descriptor.assume_versioned();
            warn!(
                status = response.status,
                message = %response.message(),
                "Instance probe answered with an error, continuing"
            );
            return Ok(ProvisionOutcome {
                exists: true,
                created: false,
            });
        }

        match classify_not_found(&response) {
            NotFoundKind::MissingRoute => {
                descriptor.set_flavor(BackendFlavor::Legacy);
                Ok(ProvisionOutcome {
                    exists: true,
                    created: false,
                })
            }
            NotFoundKind::MissingInstance => {
                descriptor.set_flavor(BackendFlavor::Versioned);
                self.create(instance_id, name).await
            }
            NotFoundKind::Ambiguous => {
                descriptor.assume_versioned();
                self.create(instance_id, name).await
            }
        }
    }

    async fn create(&self, instance_id: &str, name: &str) -> Result<ProvisionOutcome> {
        let body = json!({ "instanceId": instance_id, "name": name });
        let response = self
            .client
            .call_as(
                Operation::CreateInstance,
                BackendFlavor::Versioned,
                instance_id,
                Some(body),
                self.timeout,
            )
            .await
            .map_err(|e| PairingError::Provision(e.to_string()))?;

        if response.is_success() {
            info!(instance_id, "Instance created");
            return Ok(ProvisionOutcome {
                exists: true,
                created: true,
            });
        }

        if is_already_exists(&response) {
            debug!(instance_id, "Instance already exists");
            return Ok(ProvisionOutcome {
                exists: true,
                created: false,
            });
        }

        Err(PairingError::Provision(format!(
            "HTTP {}: {}",
            response.status,
            response.message()
        )))
    }
}

fn is_already_exists(response: &BackendResponse) -> bool {
    if response.is_conflict() {
        return true;
    }
    let text = response.body_text();
    ALREADY_EXISTS_SIGNATURES.iter().any(|s| text.contains(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_already_exists_detection() {
        assert!(is_already_exists(&BackendResponse::new(409, json!(null))));
        assert!(is_already_exists(&BackendResponse::new(
            400,
            json!({"error": "Instance inst-1 already exists"})
        )));
        assert!(!is_already_exists(&BackendResponse::new(
            400,
            json!({"error": "name is required"})
        )));
    }
}
