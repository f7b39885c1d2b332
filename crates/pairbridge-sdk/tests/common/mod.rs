// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pairbridge_sdk::{
    BackendClient, BackendDescriptor, BackendRequest, BackendResponse, ConnectionState,
    InstanceStatus, InstanceStatusRecord, MixedContentPolicy, PairingConfig, StatusSink,
    Transport,
};
use tokio::sync::watch;

/// 1x1 PNG, long enough to be recognized as bare base64 image data.
pub const PNG_BASE64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

/// Config for a wiremock backend with no artificial delays.
pub fn fast_config(backend_url: &str) -> PairingConfig {
    PairingConfig::new(backend_url, "test-key")
        .with_qr_timing(0, 0)
        .with_poll_interval_ms(20)
        .with_timeouts(1_000, 1_000, 1_000)
}

/// Sink that keeps every record in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    records: Arc<Mutex<Vec<InstanceStatusRecord>>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<InstanceStatusRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<InstanceStatus> {
        self.records().iter().map(|r| r.status).collect()
    }

    /// Wait until a record with `status` shows up (sink writes are spawned).
    pub async fn wait_for(&self, status: InstanceStatus) -> InstanceStatusRecord {
        for _ in 0..200 {
            if let Some(record) = self.records().into_iter().find(|r| r.status == status) {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "no {:?} record, got {:?}",
            status,
            self.statuses()
        );
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn record(&self, record: InstanceStatusRecord) -> pairbridge_sdk::Result<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

/// Wait until the published state satisfies `pred`.
pub async fn wait_for_state(
    state: &mut watch::Receiver<ConnectionState>,
    pred: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            {
                let current = state.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            if state.changed().await.is_err() {
                panic!("state channel closed");
            }
        }
    })
    .await;
    result.expect("state condition not reached in time")
}

type Handler = dyn Fn(&BackendRequest, usize) -> (Duration, BackendResponse) + Send + Sync;

/// In-memory transport answering from a script.
///
/// The handler receives the request and the 1-based call count for its path,
/// and returns an optional delay plus the response.
pub struct ScriptedTransport {
    handler: Box<Handler>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(
        handler: impl Fn(&BackendRequest, usize) -> (Duration, BackendResponse)
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self, path: &str) -> usize {
        self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    /// Highest number of requests that were outstanding at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Requests outstanding right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Client routed directly through this transport.
    pub fn client(self: &Arc<Self>) -> BackendClient {
        let descriptor = BackendDescriptor::new("http://bridge.test:3000", "test-key").unwrap();
        BackendClient::with_transports(
            descriptor,
            self.clone() as Arc<dyn Transport>,
            None,
            Arc::new(MixedContentPolicy::new(false)),
        )
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn send(
        &self,
        _descriptor: &BackendDescriptor,
        request: &BackendRequest,
    ) -> pairbridge_sdk::Result<BackendResponse> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(request.path.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let (delay, response) = (self.handler)(request, call);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        // Released on completion and when the call is dropped mid-flight.
        let _guard = InFlightGuard(&self.in_flight);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        Ok(response)
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
