// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport layer between the orchestrator and a bridge backend.
//!
//! Backend calls are described by a [`BackendRequest`] and answered with a
//! [`BackendResponse`] carrying the raw status code and body, regardless of
//! whether the call went straight to the backend or through a relay:
//! - `direct`: plain HTTP to the backend with bearer auth
//! - `relay`: `{path, method, body}` envelope posted to a relay endpoint
//!
//! Which of the two is used is decided per call by a [`TransportPolicy`].

pub mod direct;
pub mod relay;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::{Host, Url};

use crate::backend::BackendDescriptor;
use crate::error::Result;

/// HTTP method of a backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    pub fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single call against the backend, relative to its base URL.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: HttpMethod,
    pub path: String,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl BackendRequest {
    pub fn get(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            body: None,
            timeout,
        }
    }

    pub fn post(path: impl Into<String>, body: Option<Value>, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            body,
            timeout,
        }
    }
}

/// Raw backend answer. Non-JSON bodies are kept as a JSON string.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendResponse {
    pub status: u16,
    pub body: Value,
}

impl BackendResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// Build a response from a raw body, parsing it as JSON when possible.
    pub fn from_text(status: u16, text: &str) -> Self {
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        };
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    pub fn is_conflict(&self) -> bool {
        self.status == 409
    }

    /// Human-readable message reported by the backend, falling back to the status.
    pub fn message(&self) -> String {
        let from_field = ["message", "error", "detail", "msg"].iter().find_map(|key| {
            match self.body.get(key) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Object(inner)) => inner
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            }
        });
        match (from_field, &self.body) {
            (Some(message), _) => message,
            (None, Value::String(text)) if !text.trim().is_empty() => text.trim().to_string(),
            _ => format!("HTTP {}", self.status),
        }
    }

    /// Lower-cased body text, used for matching error signatures.
    pub fn body_text(&self) -> String {
        match &self.body {
            Value::String(s) => s.to_lowercase(),
            Value::Null => String::new(),
            other => other.to_string().to_lowercase(),
        }
    }
}

/// Moves a [`BackendRequest`] to the backend and returns its raw answer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Perform the call. Network failures and timeouts are errors; any HTTP
    /// answer, including 4xx/5xx, is a successful [`BackendResponse`].
    async fn send(
        &self,
        descriptor: &BackendDescriptor,
        request: &BackendRequest,
    ) -> Result<BackendResponse>;
}

/// How a call reaches the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Relayed,
}

/// Decides the [`Route`] for a backend URL.
pub trait TransportPolicy: Send + Sync {
    fn select(&self, backend_url: &Url) -> Route;
}

impl<F> TransportPolicy for F
where
    F: Fn(&Url) -> Route + Send + Sync,
{
    fn select(&self, backend_url: &Url) -> Route {
        self(backend_url)
    }
}

/// Mixed-content rule: a host served over a secure transport cannot call an
/// insecure, non-loopback backend, so such calls are relayed.
#[derive(Debug, Clone, Copy, Default)]
pub struct MixedContentPolicy {
    pub secure_host: bool,
}

impl MixedContentPolicy {
    pub fn new(secure_host: bool) -> Self {
        Self { secure_host }
    }
}

impl TransportPolicy for MixedContentPolicy {
    fn select(&self, backend_url: &Url) -> Route {
        if self.secure_host && backend_url.scheme() == "http" && !is_loopback(backend_url) {
            Route::Relayed
        } else {
            Route::Direct
        }
    }
}

/// Returns true for `localhost`, `*.localhost` and loopback IP literals.
pub fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}
