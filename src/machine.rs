//! Connection state machine for one tenant session.
//!
//! `ConnectionMachine::apply` is pure: it updates the state and returns the
//! side effects the transition owns, in the order they must run. The session
//! task executes them. Every flag that guards a one-shot effect (timer, lock,
//! caller notification, subscription) lives here so duplicate or late client
//! events cannot fire an effect twice.

use crate::{
    client::ClientEvent,
    types::{FailureReason, SessionState},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    Client(ClientEvent),
    PairingDeadline,
    Teardown,
}

/// First pairing result handed to the caller that requested pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    Payload(String),
    Ready,
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    CancelPairingTimer,
    ReleasePairingLock,
    ResolvePairing(PairingOutcome),
    /// Register the handle as sendable and start accepting inbound messages.
    Activate,
    EnqueueDispatch,
    HandleInbound { from: String, body: String },
    Deregister,
    DestroyHandle,
}

#[derive(Debug)]
pub struct ConnectionMachine {
    state: SessionState,
    payload: Option<String>,
    failure: Option<FailureReason>,
    timer_armed: bool,
    lock_held: bool,
    resolved: bool,
    inbound_subscribed: bool,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMachine {
    /// A machine for a freshly created handle: `Initializing`, with the
    /// pairing timer armed and the tenant's pairing lock held.
    pub fn new() -> Self {
        Self {
            state: SessionState::Initializing,
            payload: None,
            failure: None,
            timer_armed: true,
            lock_held: true,
            resolved: false,
            inbound_subscribed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn apply(&mut self, input: SessionInput) -> Vec<Effect> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        match input {
            SessionInput::Client(ClientEvent::PairingPayload(payload)) => self.on_payload(payload),
            SessionInput::Client(ClientEvent::Ready) => self.on_ready(),
            SessionInput::Client(ClientEvent::AuthFailure(message)) => self.finish(
                SessionState::Error,
                Some(FailureReason::AuthenticationFailure(message)),
            ),
            SessionInput::Client(ClientEvent::Disconnected(reason)) => {
                if self.state == SessionState::Ready {
                    self.finish(SessionState::Disconnected, None)
                } else {
                    self.finish(
                        SessionState::Error,
                        Some(FailureReason::ClientClosed(reason)),
                    )
                }
            }
            SessionInput::Client(ClientEvent::InboundMessage { from, body }) => {
                if self.state == SessionState::Ready && self.inbound_subscribed {
                    vec![Effect::HandleInbound { from, body }]
                } else {
                    Vec::new()
                }
            }
            SessionInput::PairingDeadline => {
                if !self.state.is_pairing() {
                    return Vec::new();
                }
                // the timer has already fired; there is nothing left to cancel
                self.timer_armed = false;
                self.finish(SessionState::Error, Some(FailureReason::PairingTimeout))
            }
            SessionInput::Teardown => self.finish(SessionState::Disconnected, None),
        }
    }

    fn on_payload(&mut self, payload: String) -> Vec<Effect> {
        if !self.state.is_pairing() || payload.trim().is_empty() {
            return Vec::new();
        }
        self.state = SessionState::AwaitingScan;
        self.payload = Some(payload.clone());
        if self.resolved {
            return Vec::new();
        }
        self.resolved = true;
        vec![Effect::ResolvePairing(PairingOutcome::Payload(payload))]
    }

    fn on_ready(&mut self) -> Vec<Effect> {
        if !self.state.is_pairing() {
            return Vec::new();
        }
        self.state = SessionState::Ready;
        self.payload = None;
        self.inbound_subscribed = true;

        let mut effects = Vec::with_capacity(5);
        if std::mem::take(&mut self.timer_armed) {
            effects.push(Effect::CancelPairingTimer);
        }
        effects.push(Effect::Activate);
        if std::mem::take(&mut self.lock_held) {
            effects.push(Effect::ReleasePairingLock);
        }
        if !std::mem::replace(&mut self.resolved, true) {
            effects.push(Effect::ResolvePairing(PairingOutcome::Ready));
        }
        effects.push(Effect::EnqueueDispatch);
        effects
    }

    fn finish(&mut self, terminal: SessionState, failure: Option<FailureReason>) -> Vec<Effect> {
        self.state = terminal;
        self.payload = None;
        self.inbound_subscribed = false;
        self.failure = failure.clone();

        let mut effects = Vec::with_capacity(5);
        if std::mem::take(&mut self.timer_armed) {
            effects.push(Effect::CancelPairingTimer);
        }
        if std::mem::take(&mut self.lock_held) {
            effects.push(Effect::ReleasePairingLock);
        }
        effects.push(Effect::Deregister);
        if !std::mem::replace(&mut self.resolved, true) {
            let reason = failure.unwrap_or(FailureReason::Aborted);
            effects.push(Effect::ResolvePairing(PairingOutcome::Failed(reason)));
        }
        effects.push(Effect::DestroyHandle);
        effects
    }
}
