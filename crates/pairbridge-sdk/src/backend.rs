// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend descriptor, flavor detection and the routed request entry point.
//!
//! A [`BackendDescriptor`] carries the backend URL, its credential and the
//! cached [`BackendFlavor`]. Clones share the flavor cache, so every component
//! working against the same backend sees the same classification while two
//! descriptors built for different backends never interfere.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::config::PairingConfig;
use crate::error::{PairingError, Result};
use crate::transport::direct::DirectTransport;
use crate::transport::relay::RelayTransport;
use crate::transport::{
    BackendRequest, BackendResponse, HttpMethod, MixedContentPolicy, Route, Transport,
    TransportPolicy,
};
use crate::types::BackendFlavor;

/// Identity of one backend plus its cached flavor.
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    url: Url,
    base: String,
    credential: String,
    flavor: Arc<AtomicU8>,
}

impl BackendDescriptor {
    pub fn new(url: &str, credential: impl Into<String>) -> Result<Self> {
        let parsed = Url::parse(url)?;
        Ok(Self {
            base: url.trim_end_matches('/').to_string(),
            url: parsed,
            credential: credential.into(),
            flavor: Arc::new(AtomicU8::new(BackendFlavor::Unknown.to_u8())),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// Absolute URL for a backend-relative path.
    pub fn endpoint_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base, path)
        } else {
            format!("{}/{}", self.base, path)
        }
    }

    pub fn flavor(&self) -> BackendFlavor {
        BackendFlavor::from_u8(self.flavor.load(Ordering::Acquire))
    }

    /// Record a definitive classification.
    pub fn set_flavor(&self, flavor: BackendFlavor) {
        let previous = BackendFlavor::from_u8(self.flavor.swap(flavor.to_u8(), Ordering::AcqRel));
        if previous != flavor {
            info!(
                backend = %self.base,
                from = previous.as_str(),
                to = flavor.as_str(),
                "Backend flavor classified"
            );
        }
    }

    /// Resolve an ambiguous probe: `Versioned` unless already classified.
    pub fn assume_versioned(&self) {
        let swapped = self.flavor.compare_exchange(
            BackendFlavor::Unknown.to_u8(),
            BackendFlavor::Versioned.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_ok() {
            debug!(backend = %self.base, "Ambiguous probe, assuming versioned backend");
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.flavor() == BackendFlavor::Legacy
    }
}

/// Backend operations, mapped to per-flavor paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Health,
    CreateInstance,
    Status,
    Connect,
    QrCode,
    Disconnect,
}

impl Operation {
    pub fn method(&self) -> HttpMethod {
        match self {
            Operation::Health | Operation::Status | Operation::QrCode => HttpMethod::Get,
            Operation::CreateInstance | Operation::Connect | Operation::Disconnect => {
                HttpMethod::Post
            }
        }
    }

    /// Path for this operation. `Unknown` uses the versioned shape; legacy
    /// backends have no instance creation and return `None`.
    pub fn path(&self, flavor: BackendFlavor, instance_id: &str) -> Option<String> {
        let legacy = flavor == BackendFlavor::Legacy;
        let scoped = |suffix: &str| {
            format!(
                "/api/instance/{}/{}",
                urlencoding::encode(instance_id),
                suffix
            )
        };
        let path = match self {
            Operation::Health => "/health".to_string(),
            Operation::CreateInstance if legacy => return None,
            Operation::CreateInstance => "/api/instances".to_string(),
            Operation::Status if legacy => "/status".to_string(),
            Operation::Status => scoped("status"),
            Operation::Connect if legacy => "/connect".to_string(),
            Operation::Connect => scoped("connect"),
            Operation::QrCode if legacy => "/qrcode".to_string(),
            Operation::QrCode => scoped("qrcode"),
            Operation::Disconnect if legacy => "/disconnect".to_string(),
            Operation::Disconnect => scoped("disconnect"),
        };
        Some(path)
    }
}

/// What a 404 body says about the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    /// The route itself does not exist (legacy backend)
    MissingRoute,
    /// The route exists but the instance does not
    MissingInstance,
    /// Neither signature matched
    Ambiguous,
}

const MISSING_ROUTE_SIGNATURES: &[&str] = &[
    "cannot get",
    "cannot post",
    "no such route",
    "route not found",
    "route does not exist",
    "unknown route",
    "endpoint not found",
    "not a valid endpoint",
];

const MISSING_INSTANCE_SIGNATURES: &[&str] = &[
    "instance not found",
    "instance does not exist",
    "instance doesn't exist",
    "no such instance",
    "unknown instance",
    "instance_not_found",
];

/// Classify a 404 response body.
pub fn classify_not_found(response: &BackendResponse) -> NotFoundKind {
    let text = response.body_text();
    if MISSING_INSTANCE_SIGNATURES.iter().any(|s| text.contains(s)) {
        NotFoundKind::MissingInstance
    } else if MISSING_ROUTE_SIGNATURES.iter().any(|s| text.contains(s)) {
        NotFoundKind::MissingRoute
    } else {
        NotFoundKind::Ambiguous
    }
}

/// Routed access to one backend.
///
/// Every component issues calls through [`BackendClient::request`], which
/// consults the [`TransportPolicy`] on each call and hands the request to the
/// direct or relay transport.
#[derive(Clone)]
pub struct BackendClient {
    descriptor: BackendDescriptor,
    direct: Arc<dyn Transport>,
    relay: Option<Arc<dyn Transport>>,
    policy: Arc<dyn TransportPolicy>,
}

impl BackendClient {
    /// Build a client with reqwest transports from configuration.
    pub fn from_config(config: &PairingConfig) -> Result<Self> {
        config.validate()?;
        let descriptor = BackendDescriptor::new(&config.backend_url, config.credential.clone())?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| PairingError::Config(format!("failed to build HTTP client: {}", e)))?;

        let relay: Option<Arc<dyn Transport>> = config.relay_url.as_ref().map(|relay_url| {
            Arc::new(RelayTransport::new(
                http.clone(),
                relay_url.clone(),
                config.relay_token.clone(),
            )) as Arc<dyn Transport>
        });

        Ok(Self::with_transports(
            descriptor,
            Arc::new(DirectTransport::new(http)),
            relay,
            Arc::new(MixedContentPolicy::new(config.secure_host)),
        ))
    }

    pub fn with_transports(
        descriptor: BackendDescriptor,
        direct: Arc<dyn Transport>,
        relay: Option<Arc<dyn Transport>>,
        policy: Arc<dyn TransportPolicy>,
    ) -> Self {
        Self {
            descriptor,
            direct,
            relay,
            policy,
        }
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    /// Route chosen for the next call.
    pub fn route(&self) -> Route {
        self.policy.select(self.descriptor.url())
    }

    /// Issue a call against the backend through the selected transport.
    pub async fn request(&self, request: BackendRequest) -> Result<BackendResponse> {
        let transport = match self.route() {
            Route::Direct => &self.direct,
            Route::Relayed => self.relay.as_ref().ok_or_else(|| {
                PairingError::Config(format!(
                    "backend {} must be reached through a relay but none is configured",
                    self.descriptor.base_url()
                ))
            })?,
        };
        debug!(
            transport = transport.name(),
            method = %request.method,
            path = %request.path,
            "Backend request"
        );
        transport.send(&self.descriptor, &request).await
    }

    /// Issue `operation` using the path for the current flavor.
    pub async fn call(
        &self,
        operation: Operation,
        instance_id: &str,
        body: Option<Value>,
        timeout: std::time::Duration,
    ) -> Result<BackendResponse> {
        self.call_as(
            operation,
            self.descriptor.flavor(),
            instance_id,
            body,
            timeout,
        )
        .await
    }

    /// Issue `operation` using the path for an explicit flavor.
    pub async fn call_as(
        &self,
        operation: Operation,
        flavor: BackendFlavor,
        instance_id: &str,
        body: Option<Value>,
        timeout: std::time::Duration,
    ) -> Result<BackendResponse> {
        let path = operation.path(flavor, instance_id).ok_or_else(|| {
            PairingError::Config(format!(
                "{:?} is not supported by {} backends",
                operation,
                flavor.as_str()
            ))
        })?;
        self.request(BackendRequest {
            method: operation.method(),
            path,
            body,
            timeout,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_paths_per_flavor() {
        let v = BackendFlavor::Versioned;
        let l = BackendFlavor::Legacy;
        assert_eq!(Operation::Health.path(v, "x").unwrap(), "/health");
        assert_eq!(Operation::Health.path(l, "x").unwrap(), "/health");
        assert_eq!(
            Operation::Status.path(v, "x").unwrap(),
            "/api/instance/x/status"
        );
        assert_eq!(Operation::Status.path(l, "x").unwrap(), "/status");
        assert_eq!(
            Operation::Connect.path(v, "x").unwrap(),
            "/api/instance/x/connect"
        );
        assert_eq!(Operation::Connect.path(l, "x").unwrap(), "/connect");
        assert_eq!(
            Operation::QrCode.path(v, "x").unwrap(),
            "/api/instance/x/qrcode"
        );
        assert_eq!(Operation::QrCode.path(l, "x").unwrap(), "/qrcode");
        assert_eq!(
            Operation::Disconnect.path(v, "x").unwrap(),
            "/api/instance/x/disconnect"
        );
        assert_eq!(Operation::Disconnect.path(l, "x").unwrap(), "/disconnect");
        assert_eq!(
            Operation::CreateInstance.path(v, "x").unwrap(),
            "/api/instances"
        );
        assert!(Operation::CreateInstance.path(l, "x").is_none());
    }

    #[test]
    fn test_unknown_flavor_uses_versioned_paths() {
        assert_eq!(
            Operation::Status.path(BackendFlavor::Unknown, "x").unwrap(),
            "/api/instance/x/status"
        );
    }

    #[test]
    fn test_instance_id_is_encoded() {
        assert_eq!(
            Operation::Status
                .path(BackendFlavor::Versioned, "a b/c")
                .unwrap(),
            "/api/instance/a%20b%2Fc/status"
        );
    }

    #[test]
    fn test_classify_not_found() {
        let route = BackendResponse::new(404, json!("Cannot GET /api/instance/x/status"));
        assert_eq!(classify_not_found(&route), NotFoundKind::MissingRoute);

        let route = BackendResponse::new(404, json!({"error": "Route not found"}));
        assert_eq!(classify_not_found(&route), NotFoundKind::MissingRoute);

        let instance = BackendResponse::new(404, json!({"error": "Instance not found"}));
        assert_eq!(classify_not_found(&instance), NotFoundKind::MissingInstance);

        let ambiguous = BackendResponse::new(404, json!({"error": "Not Found"}));
        assert_eq!(classify_not_found(&ambiguous), NotFoundKind::Ambiguous);
    }

    #[test]
    fn test_flavor_cache_is_shared_between_clones_only() {
        let a = BackendDescriptor::new("http://a:3000/", "k").unwrap();
        let a2 = a.clone();
        let b = BackendDescriptor::new("http://b:3000", "k").unwrap();

        a.set_flavor(BackendFlavor::Legacy);
        assert_eq!(a2.flavor(), BackendFlavor::Legacy);
        assert_eq!(b.flavor(), BackendFlavor::Unknown);
        assert_eq!(a.base_url(), "http://a:3000");
        assert_eq!(a.endpoint_url("/status"), "http://a:3000/status");
    }

    #[test]
    fn test_assume_versioned_does_not_override() {
        let d = BackendDescriptor::new("http://a", "k").unwrap();
        d.assume_versioned();
        assert_eq!(d.flavor(), BackendFlavor::Versioned);

        let d = BackendDescriptor::new("http://a", "k").unwrap();
        d.set_flavor(BackendFlavor::Legacy);
        d.assume_versioned();
        assert_eq!(d.flavor(), BackendFlavor::Legacy);
    }
}
