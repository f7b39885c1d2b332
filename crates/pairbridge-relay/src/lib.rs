// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pairbridge relay.
//!
//! A small HTTP service for hosts that are not allowed to call an insecure
//! bridge backend directly. It accepts `POST /relay` with
//! `{path, method, body}`, forwards the call to the one backend it is
//! configured for, and answers `{ok, status, data}` with the backend's status
//! code and body passed through untouched.
//!
//! When the backend cannot be reached the relay answers `502` without an
//! envelope, which clients treat as a transport failure.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `RELAY_BACKEND_URL` | Yes | - | Bridge backend base URL |
//! | `RELAY_BACKEND_TOKEN` | No | - | Bearer credential sent to the backend |
//! | `RELAY_ACCESS_TOKEN` | No | - | Bearer token callers must present |
//! | `RELAY_BIND_ADDR` | No | `127.0.0.1:8090` | Listen address |
//! | `RELAY_REQUEST_TIMEOUT_MS` | No | `15000` | Per-call backend timeout |

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use pairbridge_sdk::transport::relay::{RelayRequest, RelayResponse};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8090";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Errors answered by the relay itself, never by the backend.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing or invalid relay access token")]
    Unauthorized,

    #[error("invalid relay request: {0}")]
    InvalidRequest(String),

    #[error("path not allowed: {0}")]
    InvalidPath(String),

    #[error("backend unreachable: {0}")]
    Upstream(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest(_) | Self::InvalidPath(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub backend_url: Url,
    pub backend_token: Option<String>,
    pub access_token: Option<String>,
    pub request_timeout: Duration,
}

impl RelayConfig {
    /// Load configuration from `RELAY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let backend_url = env::var("RELAY_BACKEND_URL")
            .map_err(|_| RelayError::Config("RELAY_BACKEND_URL is required".to_string()))?;

        let bind_addr = env::var("RELAY_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.into());
        let bind_addr = bind_addr
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid RELAY_BIND_ADDR: {}", e)))?;

        let timeout_ms = env::var("RELAY_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);

        let mut config = Self::new(&backend_url)?;
        config.bind_addr = bind_addr;
        config.backend_token = env::var("RELAY_BACKEND_TOKEN").ok().filter(|t| !t.is_empty());
        config.access_token = env::var("RELAY_ACCESS_TOKEN").ok().filter(|t| !t.is_empty());
        config.request_timeout = Duration::from_millis(timeout_ms);
        Ok(config)
    }

    /// Configuration for the given backend with defaults for everything else.
    pub fn new(backend_url: &str) -> Result<Self> {
        let backend_url = Url::parse(backend_url)
            .map_err(|e| RelayError::Config(format!("invalid backend URL: {}", e)))?;
        if !matches!(backend_url.scheme(), "http" | "https") {
            return Err(RelayError::Config(format!(
                "unsupported backend scheme: {}",
                backend_url.scheme()
            )));
        }
        let bind_addr = DEFAULT_BIND_ADDR
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid bind address: {}", e)))?;

        Ok(Self {
            bind_addr,
            backend_url,
            backend_token: None,
            access_token: None,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        })
    }

    pub fn with_backend_token(mut self, token: impl Into<String>) -> Self {
        self.backend_token = Some(token.into());
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn target_url(&self, path: &str) -> String {
        format!("{}{}", self.backend_url.as_str().trim_end_matches('/'), path)
    }
}

/// State shared by the relay handlers.
#[derive(Clone)]
pub struct RelayState {
    config: Arc<RelayConfig>,
    client: reqwest::Client,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

pub fn build_app(state: RelayState) -> Router {
    Router::new()
        .route("/relay", post(relay_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn relay_handler(
    State(state): State<RelayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RelayResponse>> {
    authorize(&headers, state.config.access_token.as_deref())?;

    let request: RelayRequest = serde_json::from_slice(&body)
        .map_err(|e| RelayError::InvalidRequest(e.to_string()))?;
    validate_path(&request.path)?;

    let started = Instant::now();
    let url = state.config.target_url(&request.path);
    let mut builder = state
        .client
        .request(request.method.to_reqwest(), &url)
        .timeout(state.config.request_timeout);
    if let Some(token) = &state.config.backend_token {
        builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
        builder = builder.json(body);
    }

    let response = builder.send().await.map_err(|e| {
        warn!(method = %request.method, path = %request.path, error = %e, "Backend call failed");
        RelayError::Upstream(e.to_string())
    })?;
    let status = response.status();
    let text = response.text().await.map_err(|e| {
        warn!(method = %request.method, path = %request.path, error = %e, "Backend body unreadable");
        RelayError::Upstream(e.to_string())
    })?;

    info!(
        method = %request.method,
        path = %request.path,
        status = status.as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Relayed"
    );

    Ok(Json(RelayResponse {
        ok: status.is_success(),
        status: status.as_u16(),
        data: decode_body(&text),
    }))
}

fn authorize(headers: &HeaderMap, access_token: Option<&str>) -> Result<()> {
    let Some(expected) = access_token else {
        return Ok(());
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected => Ok(()),
        _ => Err(RelayError::Unauthorized),
    }
}

/// Only origin-relative backend paths are forwarded.
pub fn validate_path(path: &str) -> Result<()> {
    let reject = |reason: &str| Err(RelayError::InvalidPath(format!("{} ({})", path, reason)));

    if !path.starts_with('/') {
        return reject("must start with '/'");
    }
    if path.starts_with("//") || path.contains("://") {
        return reject("absolute URLs are not relayed");
    }
    if path.contains('\\') || path.chars().any(char::is_control) {
        return reject("illegal characters");
    }
    let route = path.split(['?', '#']).next().unwrap_or_default();
    if route.split('/').any(|segment| segment == ".." || segment == ".") {
        return reject("dot segments");
    }
    Ok(())
}

fn decode_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
