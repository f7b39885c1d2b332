// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pairing orchestrator: drives one pairing run at a time against a backend.
//!
//! Each run is a single tokio task. It performs the handshake (health, status,
//! provisioning, code generation), then polls the instance status on a fixed
//! interval until the device connects, the budget runs out or the run is
//! stopped. The [`PairingMachine`] decides what each tick does; this module
//! only performs the I/O it asks for.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::backend::{BackendClient, Operation};
use crate::config::PairingConfig;
use crate::error::{PairingError, Result};
use crate::health::HealthValidator;
use crate::machine::{PairingMachine, PollSettings, RefreshReason, TickAction};
use crate::pairing_code::PairingCodeGenerator;
use crate::provision::InstanceProvisioner;
use crate::sink::{HttpStatusSink, StatusSink, TracingSink};
use crate::status::{ConnectionReport, fetch_status};
use crate::types::{
    BackendFlavor, ConnectedDevice, ConnectionState, InstanceStatus, InstanceStatusRecord,
    PairingResult,
};

/// Handle to one pairing run returned by [`PairingOrchestrator::start_connection`].
pub struct PairingSession {
    instance_id: String,
    /// Live view of the run's [`ConnectionState`]
    pub state: watch::Receiver<ConnectionState>,
    /// Fires exactly once when the device is paired
    pub completion: oneshot::Receiver<ConnectedDevice>,
    failure: oneshot::Receiver<PairingError>,
}

impl std::fmt::Debug for PairingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingSession")
            .field("instance_id", &self.instance_id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl PairingSession {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Current state snapshot.
    pub fn current_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Wait for the run to finish.
    ///
    /// Returns the paired device, the error that ended the run, or
    /// [`PairingError::Cancelled`] when the run was stopped or superseded.
    pub async fn wait(self) -> Result<ConnectedDevice> {
        let PairingSession {
            mut completion,
            mut failure,
            ..
        } = self;

        tokio::select! {
            done = &mut completion => match done {
                Ok(device) => Ok(device),
                Err(_) => Err(failure.await.unwrap_or(PairingError::Cancelled)),
            },
            failed = &mut failure => match failed {
                Ok(error) => Err(error),
                Err(_) => completion.await.map_err(|_| PairingError::Cancelled),
            },
        }
    }
}

/// Components shared by the orchestrator and its run tasks.
struct Shared {
    client: BackendClient,
    health: HealthValidator,
    provisioner: InstanceProvisioner,
    generator: PairingCodeGenerator,
    sink: Arc<dyn StatusSink>,
    config: PairingConfig,
}

impl Shared {
    /// Persist a status record without waiting for the sink.
    fn record(&self, record: InstanceStatusRecord) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let instance_id = record.instance_id.clone();
            let status = record.status;
            if let Err(e) = sink.record(record).await {
                warn!(
                    instance_id = %instance_id,
                    status = status.as_str(),
                    error = %e,
                    "Failed to persist instance status"
                );
            }
        });
    }
}

enum Handshake {
    Connected { phone_number: Option<String> },
    CodeIssued(String),
}

#[derive(Default)]
struct CheckOutcome {
    code: Option<String>,
    report: Option<ConnectionReport>,
}

struct ActiveRun {
    instance_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ActiveRun {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!(instance_id = %self.instance_id, error = %e, "Pairing run panicked");
            }
        }
    }
}

/// Orchestrates device pairing against one backend.
///
/// At most one run is active at a time: starting a new run stops and joins the
/// previous one first. Dropping the orchestrator cancels the active run.
pub struct PairingOrchestrator {
    shared: Arc<Shared>,
    machine: Arc<Mutex<PairingMachine>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    active: Mutex<Option<ActiveRun>>,
    shutdown: CancellationToken,
}

impl PairingOrchestrator {
    /// Build an orchestrator with reqwest transports and the configured sink.
    ///
    /// Records go to `sink_url` when set, otherwise they are logged.
    pub fn new(config: PairingConfig) -> Result<Self> {
        let client = BackendClient::from_config(&config)?;
        let sink: Arc<dyn StatusSink> = match &config.sink_url {
            Some(url) => Arc::new(HttpStatusSink::new(reqwest::Client::new(), url.clone(), None)),
            None => Arc::new(TracingSink),
        };
        Ok(Self::with_client(client, sink, config))
    }

    /// Build an orchestrator around an existing client and sink.
    pub fn with_client(
        client: BackendClient,
        sink: Arc<dyn StatusSink>,
        config: PairingConfig,
    ) -> Self {
        let shared = Shared {
            health: HealthValidator::new(client.clone(), config.health_timeout()),
            provisioner: InstanceProvisioner::new(client.clone(), config.request_timeout()),
            generator: PairingCodeGenerator::new(client.clone(), &config),
            client,
            sink,
            config,
        };
        let machine = PairingMachine::new(PollSettings::from(&shared.config));
        let (state_tx, _) = watch::channel(ConnectionState::default());

        Self {
            shared: Arc::new(shared),
            machine: Arc::new(Mutex::new(machine)),
            state_tx: Arc::new(state_tx),
            active: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn client(&self) -> &BackendClient {
        &self.shared.client
    }

    pub fn config(&self) -> &PairingConfig {
        &self.shared.config
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Start pairing `instance_id`, using `hint` as the display name when the
    /// instance has to be created.
    ///
    /// Any run already in progress is stopped and joined first.
    #[instrument(skip(self), fields(backend = %self.shared.client.descriptor().base_url()))]
    pub async fn start_connection(&self, instance_id: &str, hint: &str) -> Result<PairingSession> {
        if instance_id.trim().is_empty() {
            return Err(PairingError::Config(
                "instance id must not be empty".to_string(),
            ));
        }

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!(previous = %previous.instance_id, "Superseding active pairing run");
            previous.stop().await;
        }

        {
            let mut machine = self.machine.lock().await;
            machine.on_start();
            self.state_tx.send_replace(machine.state().clone());
        }

        let (completion_tx, completion_rx) = oneshot::channel();
        let (failure_tx, failure_rx) = oneshot::channel();
        let cancel = self.shutdown.child_token();

        let run = PairingRun {
            shared: self.shared.clone(),
            machine: self.machine.clone(),
            state_tx: self.state_tx.clone(),
            instance_id: instance_id.to_string(),
            hint: hint.to_string(),
            cancel: cancel.clone(),
            completion: Some(completion_tx),
            failure: Some(failure_tx),
        };
        let span = info_span!("pairing_run", instance_id = %instance_id);
        let handle = tokio::spawn(run.execute().instrument(span));

        *active = Some(ActiveRun {
            instance_id: instance_id.to_string(),
            cancel,
            handle,
        });

        Ok(PairingSession {
            instance_id: instance_id.to_string(),
            state: self.state_tx.subscribe(),
            completion: completion_rx,
            failure: failure_rx,
        })
    }

    /// Stop the active run, if any. Idempotent.
    ///
    /// Cancels the polling timer and any in-flight check, and resets the
    /// overlap guard. A terminal state (connected or failed) is kept.
    pub async fn stop_polling(&self) {
        let previous = self.active.lock().await.take();
        if let Some(run) = previous {
            debug!(instance_id = %run.instance_id, "Stopping pairing run");
            run.stop().await;
        }

        let mut machine = self.machine.lock().await;
        if machine.on_stop() {
            info!("Polling stopped");
        }
        self.state_tx.send_replace(machine.state().clone());
    }

    /// Query the connection status of an instance.
    pub async fn status(&self, instance_id: &str) -> Result<ConnectionReport> {
        fetch_status(
            &self.shared.client,
            instance_id,
            self.shared.config.request_timeout(),
        )
        .await
    }

    /// Log the device out of an instance.
    ///
    /// Stops the active run first when it targets the same instance.
    #[instrument(skip(self), fields(backend = %self.shared.client.descriptor().base_url()))]
    pub async fn disconnect(&self, instance_id: &str) -> Result<()> {
        let targets_active = self
            .active
            .lock()
            .await
            .as_ref()
            .is_some_and(|run| run.instance_id == instance_id);
        if targets_active {
            self.stop_polling().await;
        }

        let client = &self.shared.client;
        let timeout = self.shared.config.request_timeout();
        if client.descriptor().flavor() == BackendFlavor::Unknown {
            // Classify first so the right endpoint set is used.
            if let Err(e) = fetch_status(client, instance_id, timeout).await {
                debug!(error = %e, "Status probe before disconnect failed");
            }
        }

        let response = client
            .call(Operation::Disconnect, instance_id, None, timeout)
            .await?;
        if !response.is_success() && !response.is_not_found() {
            return Err(PairingError::Backend {
                status: response.status,
                message: response.message(),
            });
        }

        self.shared
            .record(InstanceStatusRecord::new(instance_id, InstanceStatus::Disconnected));
        info!(instance_id, "Instance disconnected");
        Ok(())
    }
}

impl Drop for PairingOrchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// State owned by one run task.
struct PairingRun {
    shared: Arc<Shared>,
    machine: Arc<Mutex<PairingMachine>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    instance_id: String,
    hint: String,
    cancel: CancellationToken,
    completion: Option<oneshot::Sender<ConnectedDevice>>,
    failure: Option<oneshot::Sender<PairingError>>,
}

impl PairingRun {
    async fn execute(mut self) {
        let handshake = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                debug!("Pairing run cancelled during handshake");
                return;
            }

            outcome = self.handshake() => outcome,
        };

        let connected = match handshake {
            Err(e) => {
                let accepted = {
                    let mut machine = self.machine.lock().await;
                    let accepted = machine.on_failure(e.to_string());
                    self.publish(&machine);
                    accepted
                };
                if accepted {
                    self.finish_failed(e);
                }
                false
            }
            Ok(Handshake::Connected { phone_number }) => self.complete(phone_number).await,
            Ok(Handshake::CodeIssued(code)) => {
                let issued = {
                    let mut machine = self.machine.lock().await;
                    let issued = machine.on_code_issued(code, Instant::now());
                    self.publish(&machine);
                    issued
                };
                issued && self.poll().await
            }
        };

        if connected {
            self.heartbeat().await;
        }
    }

    async fn handshake(&self) -> Result<Handshake> {
        let shared = &self.shared;
        let instance_id = self.instance_id.as_str();

        shared
            .health
            .check()
            .await
            .into_result(shared.client.descriptor().base_url())?;

        match fetch_status(&shared.client, instance_id, shared.config.request_timeout()).await {
            Ok(report) if report.connected => {
                info!("Device already connected");
                return Ok(Handshake::Connected {
                    phone_number: report.phone_number,
                });
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Initial status check failed, continuing"),
        }

        shared.provisioner.ensure(instance_id, &self.hint).await?;
        shared.record(InstanceStatusRecord::new(
            instance_id,
            InstanceStatus::QrPending,
        ));

        match shared.generator.generate(instance_id, &self.hint).await? {
            PairingResult::AlreadyConnected { phone_number } => {
                Ok(Handshake::Connected { phone_number })
            }
            PairingResult::Code(code) => {
                info!("Pairing code issued");
                Ok(Handshake::CodeIssued(code))
            }
        }
    }

    /// Run the polling loop. Returns true when the device connected.
    async fn poll(&mut self) -> bool {
        let mut ticker = tokio::time::interval(self.shared.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let mut in_flight: Option<JoinHandle<CheckOutcome>> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    if let Some(handle) = in_flight.take() {
                        handle.abort();
                        if let Err(e) = handle.await {
                            if e.is_panic() {
                                warn!(error = %e, "Status check task panicked");
                            }
                        }
                    }
                    debug!("Polling cancelled");
                    return false;
                }

                joined = join_check(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    let outcome = joined.unwrap_or_else(|e| {
                        warn!(error = %e, "Status check task failed");
                        CheckOutcome::default()
                    });

                    {
                        let mut machine = self.machine.lock().await;
                        machine.on_check_finished();
                        if let Some(code) = outcome.code {
                            if machine.on_refresh(code, Instant::now()) {
                                info!("Pairing code refreshed");
                            }
                        }
                        self.publish(&machine);
                    }

                    if let Some(report) = outcome.report.filter(|r| r.connected) {
                        return self.complete(report.phone_number).await;
                    }
                }

                _ = ticker.tick() => {
                    let (action, attempts) = {
                        let mut machine = self.machine.lock().await;
                        let action = machine.on_tick(Instant::now());
                        self.publish(&machine);
                        (action, machine.state().attempts)
                    };

                    match action {
                        TickAction::Skip => {}
                        TickAction::TimedOut => {
                            warn!(attempts, "Pairing code was not scanned in time");
                            self.finish_failed(PairingError::Timeout { attempts });
                            return false;
                        }
                        TickAction::Check { refresh } => {
                            in_flight = Some(tokio::spawn(
                                run_check(
                                    self.shared.clone(),
                                    self.instance_id.clone(),
                                    self.hint.clone(),
                                    refresh,
                                )
                                .in_current_span(),
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Connected transition. Returns false when the run had already ended.
    async fn complete(&mut self, phone_number: Option<String>) -> bool {
        let transitioned = {
            let mut machine = self.machine.lock().await;
            let transitioned = machine.on_connected();
            self.publish(&machine);
            transitioned
        };
        if !transitioned {
            return false;
        }

        self.shared.record(
            InstanceStatusRecord::new(&self.instance_id, InstanceStatus::Connected)
                .with_phone_number(phone_number.clone()),
        );
        info!(phone_number = ?phone_number, "Device paired");

        let device = ConnectedDevice {
            instance_id: self.instance_id.clone(),
            phone_number,
            connected_at: Utc::now(),
        };
        if let Some(tx) = self.completion.take() {
            if tx.send(device).is_err() {
                debug!("Completion receiver dropped");
            }
        }
        true
    }

    /// Persist the failure and hand the error to the session.
    fn finish_failed(&mut self, error: PairingError) {
        warn!(error = %error, "Pairing run failed");
        self.shared.record(InstanceStatusRecord::new(
            &self.instance_id,
            InstanceStatus::Disconnected,
        ));
        if let Some(tx) = self.failure.take() {
            let _ = tx.send(error);
        }
    }

    /// Keep the connected record fresh until the session drops or the run is stopped.
    async fn heartbeat(&self) {
        let interval_ms = self.shared.config.heartbeat_interval_ms;
        if interval_ms == 0 {
            return;
        }
        let interval = Duration::from_millis(interval_ms);
        debug!(interval_ms, "Connected heartbeat started");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!("Connected heartbeat cancelled");
                    break;
                }

                _ = tokio::time::sleep(interval) => {}
            }

            let status = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                status = fetch_status(
                    &self.shared.client,
                    &self.instance_id,
                    self.shared.config.request_timeout(),
                ) => status,
            };

            match status {
                Ok(report) if report.connected => {
                    self.shared.record(
                        InstanceStatusRecord::new(&self.instance_id, InstanceStatus::Connected)
                            .with_phone_number(report.phone_number)
                            .with_heartbeat(),
                    );
                    debug!("Connected heartbeat recorded");
                }
                Ok(_) => {
                    warn!("Session dropped, stopping heartbeat");
                    self.shared.record(InstanceStatusRecord::new(
                        &self.instance_id,
                        InstanceStatus::Disconnected,
                    ));
                    break;
                }
                Err(e) => warn!(error = %e, "Heartbeat status check failed"),
            }
        }
    }

    fn publish(&self, machine: &PairingMachine) {
        self.state_tx.send_replace(machine.state().clone());
    }
}

async fn join_check(
    slot: &mut Option<JoinHandle<CheckOutcome>>,
) -> std::result::Result<CheckOutcome, JoinError> {
    match slot {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// One polling check: optional code refresh, then a status query.
///
/// Refresh and status failures are logged and read as "not connected yet".
async fn run_check(
    shared: Arc<Shared>,
    instance_id: String,
    hint: String,
    refresh: Option<RefreshReason>,
) -> CheckOutcome {
    let mut outcome = CheckOutcome::default();

    if let Some(reason) = refresh {
        debug!(reason = ?reason, "Refreshing pairing code");
        match shared.generator.generate(&instance_id, &hint).await {
            Ok(PairingResult::Code(code)) => outcome.code = Some(code),
            Ok(PairingResult::AlreadyConnected { phone_number }) => {
                outcome.report = Some(ConnectionReport {
                    connected: true,
                    phone_number,
                    state: None,
                });
                return outcome;
            }
            Err(e) => debug!(error = %e, "Code refresh failed, keeping current code"),
        }
    }

    match fetch_status(&shared.client, &instance_id, shared.config.request_timeout()).await {
        Ok(report) => outcome.report = Some(report),
        Err(e) => debug!(error = %e, "Status check failed, treating as not connected"),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (
        PairingSession,
        oneshot::Sender<ConnectedDevice>,
        oneshot::Sender<PairingError>,
    ) {
        let (_state_tx, state) = watch::channel(ConnectionState::default());
        let (completion_tx, completion) = oneshot::channel();
        let (failure_tx, failure) = oneshot::channel();
        (
            PairingSession {
                instance_id: "inst-1".into(),
                state,
                completion,
                failure,
            },
            completion_tx,
            failure_tx,
        )
    }

    #[tokio::test]
    async fn test_wait_returns_device() {
        let (session, completion, _failure) = session();
        completion
            .send(ConnectedDevice {
                instance_id: "inst-1".into(),
                phone_number: Some("5511999999999".into()),
                connected_at: Utc::now(),
            })
            .unwrap();
        let device = session.wait().await.unwrap();
        assert_eq!(device.phone_number.as_deref(), Some("5511999999999"));
    }

    #[tokio::test]
    async fn test_wait_returns_failure() {
        let (session, _completion, failure) = session();
        failure.send(PairingError::Timeout { attempts: 150 }).unwrap();
        assert!(matches!(
            session.wait().await,
            Err(PairingError::Timeout { attempts: 150 })
        ));
    }

    #[tokio::test]
    async fn test_wait_cancelled_when_run_dropped() {
        let (session, completion, failure) = session();
        drop(completion);
        drop(failure);
        assert!(matches!(session.wait().await, Err(PairingError::Cancelled)));
    }
}
