//! In-process chat client used for local runs (`CHAT_CLIENT=memory`) and tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use super::{ChatClient, ClientConnection, ClientEvent, ClientHandle};
use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub handle: ClientHandle,
    pub to: String,
    pub text: String,
}

#[derive(Default)]
struct MemoryClientState {
    latest: HashMap<String, ClientHandle>,
    subscribers: HashMap<ClientHandle, mpsc::UnboundedSender<ClientEvent>>,
    created: Vec<(String, ClientHandle)>,
    destroyed: Vec<ClientHandle>,
    sent: Vec<SentMessage>,
    failing_recipients: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryChatClient {
    state: Mutex<MemoryClientState>,
    next_id: AtomicUsize,
    fail_create: AtomicBool,
    created_notify: Notify,
}

impl MemoryChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryClientState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Emits `event` on the most recently created handle for `tenant_id`.
    /// Returns false when no live subscriber receives it.
    pub fn emit(&self, tenant_id: &str, event: ClientEvent) -> bool {
        let state = self.lock();
        let Some(handle) = state.latest.get(tenant_id) else {
            return false;
        };
        state
            .subscribers
            .get(handle)
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    pub fn emit_to(&self, handle: &ClientHandle, event: ClientEvent) -> bool {
        let state = self.lock();
        state
            .subscribers
            .get(handle)
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    pub fn latest_handle(&self, tenant_id: &str) -> Option<ClientHandle> {
        self.lock().latest.get(tenant_id).cloned()
    }

    pub fn created_count(&self, tenant_id: &str) -> usize {
        self.lock()
            .created
            .iter()
            .filter(|(tenant, _)| tenant == tenant_id)
            .count()
    }

    /// Resolves once at least `count` handles have been created for `tenant_id`.
    pub async fn wait_for_created(&self, tenant_id: &str, count: usize) {
        loop {
            let notified = self.created_notify.notified();
            if self.created_count(tenant_id) >= count {
                return;
            }
            notified.await;
        }
    }

    pub fn destroyed(&self) -> Vec<ClientHandle> {
        self.lock().destroyed.clone()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.lock().sent.clone()
    }

    pub fn fail_sends_to(&self, address: &str) {
        self.lock().failing_recipients.insert(address.to_string());
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatClient for MemoryChatClient {
    async fn create(&self, tenant_id: &str) -> Result<ClientConnection, AppError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(AppError::Client(format!(
                "memory client refused to create a session for {tenant_id}"
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = ClientHandle::new(format!("mem-{tenant_id}-{id}"));
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            state.latest.insert(tenant_id.to_string(), handle.clone());
            state.subscribers.insert(handle.clone(), tx);
            state.created.push((tenant_id.to_string(), handle.clone()));
        }
        self.created_notify.notify_waiters();
        Ok(ClientConnection { handle, events: rx })
    }

    async fn send(&self, handle: &ClientHandle, to: &str, text: &str) -> Result<(), AppError> {
        let mut state = self.lock();
        if !state.subscribers.contains_key(handle) {
            return Err(AppError::SendFailure {
                to: to.to_string(),
                reason: format!("handle {handle} is not live"),
            });
        }
        if state.failing_recipients.contains(to) {
            return Err(AppError::SendFailure {
                to: to.to_string(),
                reason: "recipient rejected".to_string(),
            });
        }
        state.sent.push(SentMessage {
            handle: handle.clone(),
            to: to.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn destroy(&self, handle: &ClientHandle) -> Result<(), AppError> {
        let mut state = self.lock();
        state.subscribers.remove(handle);
        state.destroyed.push(handle.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn functional_emit_reaches_latest_handle_until_destroyed() {
        let client = MemoryChatClient::new();
        let mut connection = client.create("u1").await.expect("create");
        assert!(client.emit("u1", ClientEvent::Ready));
        assert_eq!(connection.events.recv().await, Some(ClientEvent::Ready));

        client.destroy(&connection.handle).await.expect("destroy");
        assert!(!client.emit("u1", ClientEvent::Ready));
        assert_eq!(client.destroyed(), vec![connection.handle.clone()]);
    }

    #[tokio::test]
    async fn functional_send_records_and_honors_failing_recipients() {
        let client = MemoryChatClient::new();
        let connection = client.create("u1").await.expect("create");
        client.fail_sends_to("2@c.us");

        client
            .send(&connection.handle, "1@c.us", "hello")
            .await
            .expect("send");
        let err = client
            .send(&connection.handle, "2@c.us", "hello")
            .await
            .expect_err("rejected");
        assert!(matches!(err, AppError::SendFailure { .. }));
        assert_eq!(client.sent().len(), 1);
        assert_eq!(client.sent()[0].to, "1@c.us");
    }
}
