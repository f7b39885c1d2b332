// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pairing run state machine.
//!
//! [`PairingMachine`] owns the [`ConnectionState`] of one run and decides what
//! each polling tick does. It performs no I/O and reads no clock: callers pass
//! `now` in, which keeps every transition testable without timers.
//!
//! ```text
//! Idle -> Connecting -> Connected
//!                    -> Errored
//!                    -> QrPending -> Polling -> Connected | TimedOut | Errored
//! ```

use std::time::Duration;

use tokio::time::Instant;

use crate::config::PairingConfig;
use crate::error::PairingError;
use crate::types::ConnectionState;

/// Lifecycle phase of a pairing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    /// Health check, status check, provisioning and code generation
    Connecting,
    /// Code issued, polling not started yet
    QrPending,
    Polling,
    Connected,
    TimedOut,
    Errored,
}

impl Phase {
    /// Whether the run can still make progress.
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Connecting | Phase::QrPending | Phase::Polling)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Connected | Phase::TimedOut | Phase::Errored)
    }
}

/// Polling budget and refresh timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub max_attempts: u32,
    pub refresh_after: Duration,
    /// 0 disables the nudge
    pub stall_nudge_attempt: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_attempts: 150,
            refresh_after: Duration::from_secs(45),
            stall_nudge_attempt: 35,
        }
    }
}

impl From<&PairingConfig> for PollSettings {
    fn from(config: &PairingConfig) -> Self {
        Self {
            max_attempts: config.max_poll_attempts.max(1),
            refresh_after: config.qr_refresh_interval(),
            stall_nudge_attempt: config.stall_nudge_attempt,
        }
    }
}

/// Why a tick asks for a fresh code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    /// The displayed code is older than the refresh window
    Timer,
    /// One-off refresh at the stall attempt
    StallNudge,
}

/// What the driver should do for a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Nothing: a check is still running, or the run is not polling
    Skip,
    /// Budget exhausted; the machine already moved to `TimedOut`
    TimedOut,
    /// Run a status check, optionally refreshing the code first
    Check { refresh: Option<RefreshReason> },
}

/// Explicit state machine for one pairing run.
#[derive(Debug, Clone, Default)]
pub struct PairingMachine {
    phase: Phase,
    state: ConnectionState,
    settings: PollSettings,
    issued_at: Option<Instant>,
    in_flight: bool,
    nudged: bool,
}

impl PairingMachine {
    pub fn new(settings: PollSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Whether a status check is currently outstanding.
    pub fn is_check_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Reset everything and enter `Connecting`.
    pub fn on_start(&mut self) {
        self.phase = Phase::Connecting;
        self.state = ConnectionState {
            is_connecting: true,
            ..ConnectionState::default()
        };
        self.issued_at = None;
        self.in_flight = false;
        self.nudged = false;
    }

    /// A pairing code was issued; polling starts with a fresh budget.
    ///
    /// Returns false when the run is no longer connecting.
    pub fn on_code_issued(&mut self, code: String, now: Instant) -> bool {
        if self.phase != Phase::Connecting {
            return false;
        }
        self.phase = Phase::QrPending;
        self.state = ConnectionState {
            is_connecting: false,
            is_polling: true,
            qr_code: Some(code),
            error: None,
            attempts: 0,
        };
        self.issued_at = Some(now);
        true
    }

    /// Advance one polling tick.
    pub fn on_tick(&mut self, now: Instant) -> TickAction {
        if !matches!(self.phase, Phase::QrPending | Phase::Polling) || self.in_flight {
            return TickAction::Skip;
        }
        self.phase = Phase::Polling;
        self.state.attempts += 1;

        if self.state.attempts >= self.settings.max_attempts {
            let message = PairingError::Timeout {
                attempts: self.state.attempts,
            }
            .to_string();
            self.fail(Phase::TimedOut, message);
            return TickAction::TimedOut;
        }

        let refresh = if self.settings.stall_nudge_attempt > 0
            && self.state.attempts == self.settings.stall_nudge_attempt
            && !self.nudged
        {
            self.nudged = true;
            Some(RefreshReason::StallNudge)
        } else if self
            .issued_at
            .is_some_and(|issued| now.saturating_duration_since(issued) >= self.settings.refresh_after)
        {
            Some(RefreshReason::Timer)
        } else {
            None
        };

        // A failed refresh must not be retried on every tick.
        if refresh.is_some() {
            self.issued_at = Some(now);
        }

        self.in_flight = true;
        TickAction::Check { refresh }
    }

    /// Replace the displayed code. `attempts` is not reset.
    pub fn on_refresh(&mut self, code: String, now: Instant) -> bool {
        if !matches!(self.phase, Phase::QrPending | Phase::Polling) {
            return false;
        }
        self.state.qr_code = Some(code);
        self.issued_at = Some(now);
        true
    }

    /// The outstanding status check finished.
    pub fn on_check_finished(&mut self) {
        self.in_flight = false;
    }

    /// The device is paired.
    ///
    /// Returns true only for the transition into `Connected`, so completion
    /// side effects run once.
    pub fn on_connected(&mut self) -> bool {
        if !self.phase.is_active() {
            return false;
        }
        self.phase = Phase::Connected;
        self.in_flight = false;
        self.issued_at = None;
        self.state.is_connecting = false;
        self.state.is_polling = false;
        self.state.qr_code = None;
        self.state.error = None;
        true
    }

    /// Terminal failure. Returns false when the run had already ended.
    pub fn on_failure(&mut self, message: impl Into<String>) -> bool {
        if !self.phase.is_active() {
            return false;
        }
        self.fail(Phase::Errored, message.into());
        true
    }

    /// Stop the run. Safe to call any number of times in any phase.
    ///
    /// Returns true when an active run was interrupted.
    pub fn on_stop(&mut self) -> bool {
        self.in_flight = false;
        self.issued_at = None;
        self.state.is_connecting = false;
        self.state.is_polling = false;
        if !self.phase.is_active() {
            return false;
        }
        self.phase = Phase::Idle;
        self.state.qr_code = None;
        true
    }

    fn fail(&mut self, phase: Phase, message: String) {
        self.phase = phase;
        self.in_flight = false;
        self.issued_at = None;
        self.state.is_connecting = false;
        self.state.is_polling = false;
        self.state.qr_code = None;
        self.state.error = Some(message);
    }
}
