// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pairbridge SDK - Device pairing against self-hosted messaging bridge backends.
//!
//! A bridge backend holds a messaging-network session for one or more
//! instances. Pairing a phone means getting a pairing code from the backend,
//! showing it as a QR image, and waiting until the phone has scanned it. This
//! crate drives that exchange end to end and hides the differences between
//! backend generations.
//!
//! # Features
//!
//! - **Health Validation**: Bounded pre-flight check that tells a wrong API key
//!   apart from a backend that is not running
//! - **Flavor Detection**: Single-instance (legacy) and multi-instance
//!   (versioned) backends are told apart from probe responses and cached per
//!   backend
//! - **Provisioning**: Idempotent instance creation on versioned backends
//! - **Pairing Codes**: Data URIs, bare base64 images and opaque pairing strings
//!   are all normalized into a PNG data URI
//! - **Status Polling**: Fixed-interval polling with auto-refresh, a stall
//!   nudge, an overlap guard and a bounded budget
//! - **Relay Routing**: Calls that a secure host cannot make directly are sent
//!   through a relay endpoint
//! - **Status Sinks**: Connected, pending and disconnected transitions are
//!   persisted fire-and-forget
//!
//! # Quick Start
//!
//! ```ignore
//! use pairbridge_sdk::{PairingConfig, PairingOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> pairbridge_sdk::Result<()> {
//!     let config = PairingConfig::new("http://bridge.local:3000", "api-key");
//!     let orchestrator = PairingOrchestrator::new(config)?;
//!
//!     let session = orchestrator.start_connection("store-42", "Store 42").await?;
//!
//!     // Render every new code as it is issued or refreshed
//!     let mut state = session.state.clone();
//!     tokio::spawn(async move {
//!         while state.changed().await.is_ok() {
//!             if let Some(code) = state.borrow().qr_code.clone() {
//!                 show_qr(&code);
//!             }
//!         }
//!     });
//!
//!     let device = session.wait().await?;
//!     println!("paired {:?}", device.phone_number);
//!     Ok(())
//! }
//! ```
//!
//! # State
//!
//! Every run publishes a [`ConnectionState`] through a watch channel. A
//! terminal failure always has the shape `is_connecting == false`,
//! `is_polling == false`, `qr_code == None`, `error == Some(..)`.
//!
//! Starting a new run stops and joins the previous one.
//! [`PairingOrchestrator::stop_polling`] can be called any number of times.
//!
//! # Configuration
//!
//! ## Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PAIRBRIDGE_BACKEND_URL` | Yes | - | Backend base URL |
//! | `PAIRBRIDGE_API_KEY` | Yes | - | Bearer credential |
//! | `PAIRBRIDGE_RELAY_URL` | No | - | Relay endpoint |
//! | `PAIRBRIDGE_RELAY_TOKEN` | No | - | Relay bearer token |
//! | `PAIRBRIDGE_SECURE_HOST` | No | `false` | Host runs on a secure origin |
//! | `PAIRBRIDGE_HEALTH_TIMEOUT_MS` | No | `5000` | Health check timeout |
//! | `PAIRBRIDGE_REQUEST_TIMEOUT_MS` | No | `15000` | Status/provision timeout |
//! | `PAIRBRIDGE_QR_TIMEOUT_MS` | No | `30000` | Code fetch timeout |
//! | `PAIRBRIDGE_POLL_INTERVAL_MS` | No | `1000` | Polling tick interval |
//! | `PAIRBRIDGE_MAX_POLL_ATTEMPTS` | No | `150` | Polling budget |
//! | `PAIRBRIDGE_QR_REFRESH_MS` | No | `45000` | Code auto-refresh window |
//! | `PAIRBRIDGE_STALL_NUDGE_ATTEMPT` | No | `35` | Forced refresh attempt |
//! | `PAIRBRIDGE_QR_GRACE_MS` | No | `1200` | Wait after "start connect" |
//! | `PAIRBRIDGE_QR_RETRY_DELAY_MS` | No | `1000` | Delay between code fetches |
//! | `PAIRBRIDGE_HEARTBEAT_INTERVAL_MS` | No | `0` | Connected heartbeat (0 = off) |
//! | `PAIRBRIDGE_SINK_URL` | No | - | Status record endpoint |
//!
//! ## Programmatic Configuration
//!
//! ```ignore
//! use pairbridge_sdk::PairingConfig;
//!
//! let config = PairingConfig::new("http://10.0.0.5:3000", "api-key")
//!     .with_secure_host(true)
//!     .with_relay("https://app.example.com/relay", Some("relay-token".into()))
//!     .with_heartbeat_interval_ms(60_000);
//! ```

mod backend;
mod config;
mod error;
mod health;
mod machine;
mod orchestrator;
mod pairing_code;
mod provision;
mod sink;
mod status;
mod types;

pub mod transport;

// Main types
pub use config::PairingConfig;
pub use error::{PairingError, Result};
pub use orchestrator::{PairingOrchestrator, PairingSession};
pub use types::{
    BackendFlavor, ConnectedDevice, ConnectionState, HealthStatus, InstanceStatus,
    InstanceStatusRecord, PairingResult, ProvisionOutcome,
};

// Components, usable on their own
pub use backend::{BackendClient, BackendDescriptor, NotFoundKind, Operation, classify_not_found};
pub use health::HealthValidator;
pub use machine::{PairingMachine, Phase, PollSettings, RefreshReason, TickAction};
pub use pairing_code::{PairingCodeGenerator, normalize};
pub use provision::InstanceProvisioner;
pub use status::{ConnectionReport, fetch_status, parse_status, phone_from_identifier};

// Persistence
pub use sink::{HttpStatusSink, NoopSink, StatusSink, TracingSink};

// Transport
pub use transport::{
    BackendRequest, BackendResponse, HttpMethod, MixedContentPolicy, Route, Transport,
    TransportPolicy,
};
