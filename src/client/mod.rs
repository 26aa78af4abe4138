//! Seam to the external chat-automation client.
//!
//! The automation client owns the wire protocol. This crate only creates a
//! client instance per tenant, consumes the events it emits, sends plain text
//! through it and destroys it.

pub mod bridge;
pub mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::AppError;

pub use bridge::{BridgeChatClient, BridgeEventRouter};
pub use memory::MemoryChatClient;

/// Opaque reference to one external client instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientHandle(String);

impl ClientHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    PairingPayload(String),
    Ready,
    AuthFailure(String),
    Disconnected(String),
    InboundMessage { from: String, body: String },
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PairingPayload(_) => "pairing_payload",
            Self::Ready => "ready",
            Self::AuthFailure(_) => "auth_failure",
            Self::Disconnected(_) => "disconnected",
            Self::InboundMessage { .. } => "inbound_message",
        }
    }
}

/// A freshly created client instance together with its event subscription.
/// Dropping `events` unsubscribes.
#[derive(Debug)]
pub struct ClientConnection {
    pub handle: ClientHandle,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn create(&self, tenant_id: &str) -> Result<ClientConnection, AppError>;

    async fn send(&self, handle: &ClientHandle, to: &str, text: &str) -> Result<(), AppError>;

    async fn destroy(&self, handle: &ClientHandle) -> Result<(), AppError>;
}
