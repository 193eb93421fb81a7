//! Lifecycle of one live connection, shared by the server-side handler and the
//! client-side driver.
//!
//! `Disconnected -> Connecting -> Authenticated -> Active -> Disconnected`.
//! Once an instance reaches `Disconnected` through [`SessionMachine::disconnect`]
//! it is finished; a reconnect creates a new machine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Token rejected. Requires fresh credentials.
    AuthFailure,
    /// Network drop, server close or any other transport error.
    TransportFailure,
    /// No authentication within the handshake window.
    HandshakeTimeout,
    /// A newer connection for the same user replaced this one.
    Superseded,
    /// The peer could not keep up with its outbound queue.
    SlowConsumer,
    /// Explicit logout.
    Logout,
    /// Replaced locally, e.g. by a channel switch during a reconnect.
    Cancelled,
}

impl DisconnectReason {
    /// Whether a client should schedule another attempt after this reason.
    pub fn should_reconnect(self) -> bool {
        matches!(
            self,
            Self::TransportFailure | Self::HandshakeTimeout | Self::SlowConsumer
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition from {from:?} ({action})")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub action: &'static str,
}

#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: SessionState,
    reason: Option<DisconnectReason>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            reason: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.reason
    }

    pub fn is_finished(&self) -> bool {
        self.reason.is_some()
    }

    pub fn begin_connect(&mut self) -> Result<SessionState, InvalidTransition> {
        self.transition(SessionState::Disconnected, SessionState::Connecting, "connect")
    }

    pub fn authenticated(&mut self) -> Result<SessionState, InvalidTransition> {
        self.transition(
            SessionState::Connecting,
            SessionState::Authenticated,
            "authenticate",
        )
    }

    pub fn activate(&mut self) -> Result<SessionState, InvalidTransition> {
        self.transition(SessionState::Authenticated, SessionState::Active, "activate")
    }

    /// Moves to the terminal `Disconnected` state. Repeated calls keep the first
    /// reason.
    pub fn disconnect(&mut self, reason: DisconnectReason) -> SessionState {
        if self.reason.is_none() {
            self.reason = Some(reason);
        }
        self.state = SessionState::Disconnected;
        self.state
    }

    fn transition(
        &mut self,
        from: SessionState,
        to: SessionState,
        action: &'static str,
    ) -> Result<SessionState, InvalidTransition> {
        if self.state != from || self.is_finished() {
            return Err(InvalidTransition {
                from: self.state,
                action,
            });
        }
        self.state = to;
        Ok(to)
    }
}
