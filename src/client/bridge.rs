//! HTTP client for an external chat-automation bridge.
//!
//! The bridge hosts the actual chat-network clients. Commands go out as REST
//! calls; events come back as signed callbacks on `/api/bridge/events`, which
//! the router hands to [`BridgeEventRouter::route`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ChatClient, ClientConnection, ClientEvent, ClientHandle};
use crate::error::AppError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Header carrying `sha256=<hex hmac>` of the callback body.
pub const SIGNATURE_HEADER: &str = "x-bridge-signature";

/// Callback body posted by the bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeEnvelope {
    pub session_id: String,
    #[serde(flatten)]
    pub event: BridgeEvent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    PairingPayload {
        payload: String,
    },
    Ready,
    AuthFailure {
        #[serde(default)]
        message: String,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    InboundMessage {
        from: String,
        #[serde(default)]
        body: String,
    },
}

impl From<BridgeEvent> for ClientEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::PairingPayload { payload } => ClientEvent::PairingPayload(payload),
            BridgeEvent::Ready => ClientEvent::Ready,
            BridgeEvent::AuthFailure { message } => ClientEvent::AuthFailure(message),
            BridgeEvent::Disconnected { reason } => ClientEvent::Disconnected(reason),
            BridgeEvent::InboundMessage { from, body } => {
                ClientEvent::InboundMessage { from, body }
            }
        }
    }
}

/// Maps bridge session ids to the event subscription of the owning session.
#[derive(Default)]
pub struct BridgeEventRouter {
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<ClientEvent>>>,
}

impl BridgeEventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<ClientEvent>>> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn subscribe(&self, session_id: &str) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(session_id.to_string(), tx);
        rx
    }

    fn unsubscribe(&self, session_id: &str) {
        self.lock().remove(session_id);
    }

    /// Delivers a bridge callback. Returns false for unknown or closed sessions.
    pub fn route(&self, envelope: BridgeEnvelope) -> bool {
        let mut routes = self.lock();
        let Some(tx) = routes.get(&envelope.session_id) else {
            debug!(session_id = %envelope.session_id, "dropping event for unknown bridge session");
            return false;
        };
        if tx.send(envelope.event.into()).is_ok() {
            return true;
        }
        routes.remove(&envelope.session_id);
        false
    }
}

/// Decodes `sha256=<hex>` (the prefix is optional) into the raw digest.
fn parse_signature(header: &str) -> Option<Vec<u8>> {
    let header = header.trim();
    let digest = header.strip_prefix("sha256=").unwrap_or(header).trim();
    if digest.is_empty() {
        return None;
    }
    hex::decode(digest).ok()
}

fn body_mac(secret: &str, body: &[u8]) -> Option<Hmac<Sha256>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(mac)
}

/// Checks a callback body against its signature header. An empty secret
/// disables the check.
pub fn verify_bridge_signature(secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if secret.is_empty() {
        return true;
    }
    match (signature_header.and_then(parse_signature), body_mac(secret, body)) {
        (Some(expected), Some(mac)) => mac.verify_slice(&expected).is_ok(),
        _ => false,
    }
}

pub fn sign_bridge_body(secret: &str, body: &[u8]) -> Option<String> {
    let digest = body_mac(secret, body)?.finalize().into_bytes();
    Some(format!("sha256={}", hex::encode(digest)))
}

pub struct BridgeChatClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    callback_url: String,
    router: Arc<BridgeEventRouter>,
}

impl BridgeChatClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        token: &str,
        public_base_url: &str,
        router: Arc<BridgeEventRouter>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            callback_url: format!("{}/api/bridge/events", public_base_url.trim_end_matches('/')),
            router,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .timeout(REQUEST_TIMEOUT);
        if self.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.token)
        }
    }
}

async fn error_detail(response: reqwest::Response) -> String {
    let status = response.status();
    let raw_body = response.text().await.unwrap_or_default();
    let normalized = raw_body.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.len() > 220 {
        let cut = (0..=220)
            .rev()
            .find(|i| normalized.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{status}: {}...", &normalized[..cut])
    } else {
        format!("{status}: {normalized}")
    }
}

#[async_trait]
impl ChatClient for BridgeChatClient {
    async fn create(&self, tenant_id: &str) -> Result<ClientConnection, AppError> {
        // the bridge may call back before it answers, so the route must exist first
        let session_id = Uuid::new_v4().to_string();
        let events = self.router.subscribe(&session_id);
        let response = self
            .request(reqwest::Method::POST, "/sessions")
            .json(&json!({
                "sessionId": session_id,
                "tenantId": tenant_id,
                "webhookUrl": self.callback_url,
            }))
            .send()
            .await;
        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                self.router.unsubscribe(&session_id);
                return Err(AppError::Client(format!(
                    "bridge create returned {}",
                    error_detail(response).await
                )));
            }
            Err(err) => {
                self.router.unsubscribe(&session_id);
                return Err(AppError::Client(format!("bridge create request failed: {err}")));
            }
        };
        debug!(session_id = %session_id, status = %response.status(), "bridge session created");
        Ok(ClientConnection {
            handle: ClientHandle::new(&session_id),
            events,
        })
    }

    async fn send(&self, handle: &ClientHandle, to: &str, text: &str) -> Result<(), AppError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/sessions/{}/messages", handle.id()),
            )
            .json(&json!({ "to": to, "text": text }))
            .send()
            .await
            .map_err(|err| AppError::SendFailure {
                to: to.to_string(),
                reason: err.to_string(),
            })?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(AppError::SendFailure {
            to: to.to_string(),
            reason: error_detail(response).await,
        })
    }

    async fn destroy(&self, handle: &ClientHandle) -> Result<(), AppError> {
        self.router.unsubscribe(handle.id());
        let response = self
            .request(reqwest::Method::DELETE, &format!("/sessions/{}", handle.id()))
            .send()
            .await
            .map_err(|err| AppError::Client(format!("bridge destroy request failed: {err}")))?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        warn!(handle = %handle, %status, "bridge refused to destroy session");
        Err(AppError::Client(format!(
            "bridge destroy returned {}",
            error_detail(response).await
        )))
    }
}
