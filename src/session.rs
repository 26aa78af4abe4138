//! Per-tenant session runtime.
//!
//! Each session is one tokio task that owns the client handle, the
//! [`ConnectionMachine`] and the [`PairingTimer`]. Client events, teardown
//! requests and the pairing deadline all arrive on the task's inputs, so
//! transitions for a session are applied strictly one at a time. Other
//! components hold an [`SessionEntry`] to read state, send through the handle
//! once it is active, or request teardown.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::{
    client::{ChatClient, ClientConnection, ClientEvent, ClientHandle},
    correlator::ReplyCorrelator,
    dispatch::Dispatcher,
    machine::{ConnectionMachine, Effect, PairingOutcome, SessionInput},
    registry::SessionRegistry,
    supervisor::PairingTimer,
    types::{SessionSnapshot, SessionState, SessionStatus},
};

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Teardown { ack: Option<oneshot::Sender<()>> },
    PairingDeadline,
}

/// Collaborators shared by every session task.
pub struct SessionContext {
    pub registry: Arc<SessionRegistry>,
    pub client: Arc<dyn ChatClient>,
    pub dispatcher: Arc<Dispatcher>,
    pub correlator: Arc<ReplyCorrelator>,
    pub teardown_timeout: Duration,
}

pub struct SessionEntry {
    session_id: u64,
    tenant_id: String,
    handle: ClientHandle,
    snapshot: watch::Receiver<SessionSnapshot>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    active: AtomicBool,
    messages_sent: AtomicU64,
}

impl SessionEntry {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// The client handle, whether or not the session is ready to send.
    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_snapshot(&self.tenant_id, &self.snapshot(), self.messages_sent())
    }

    /// The handle, but only while the session is ready and registered for sending.
    pub fn sendable_handle(&self) -> Option<ClientHandle> {
        if self.active.load(Ordering::SeqCst) && self.state() == SessionState::Ready {
            Some(self.handle.clone())
        } else {
            None
        }
    }

    pub fn record_sent(&self) -> u64 {
        self.messages_sent.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Asks the session task to tear down without waiting. Returns false when
    /// the task has already finished.
    pub fn request_teardown(&self) -> bool {
        self.commands
            .send(SessionCommand::Teardown { ack: None })
            .is_ok()
    }

    /// Tears the session down and waits until its handle has been destroyed.
    /// Safe to call any number of times, from any number of tasks.
    pub async fn teardown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::Teardown { ack: Some(ack_tx) })
            .is_err()
        {
            return;
        }
        let _ = ack_rx.await;
    }

    #[cfg(test)]
    pub(crate) fn inject_pairing_deadline(&self) -> bool {
        self.commands.send(SessionCommand::PairingDeadline).is_ok()
    }

    /// An entry with no session task behind it, for exercising components that
    /// only read entries. The returned sender drives its published state.
    #[cfg(test)]
    pub(crate) fn detached(
        tenant_id: &str,
        session_id: u64,
        handle: ClientHandle,
    ) -> (Arc<Self>, watch::Sender<SessionSnapshot>) {
        let now = Utc::now();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            state: SessionState::Initializing,
            pairing_payload: None,
            pairing_deadline: None,
            created_at: now,
            last_transition_at: now,
            failure: None,
        });
        let (commands, _) = mpsc::unbounded_channel();
        let entry = Arc::new(Self {
            session_id,
            tenant_id: tenant_id.to_string(),
            handle,
            snapshot: snapshot_rx,
            commands,
            active: AtomicBool::new(false),
            messages_sent: AtomicU64::new(0),
        });
        (entry, snapshot_tx)
    }

    /// A detached entry that is ready and sendable.
    #[cfg(test)]
    pub(crate) fn detached_ready(
        tenant_id: &str,
        session_id: u64,
        handle: ClientHandle,
    ) -> (Arc<Self>, watch::Sender<SessionSnapshot>) {
        let (entry, snapshot_tx) = Self::detached(tenant_id, session_id, handle);
        snapshot_tx.send_modify(|snapshot| snapshot.state = SessionState::Ready);
        entry.active.store(true, Ordering::SeqCst);
        (entry, snapshot_tx)
    }
}

pub(crate) struct SpawnedSession {
    pub entry: Arc<SessionEntry>,
    pub outcome: oneshot::Receiver<PairingOutcome>,
}

/// Registers a session for a freshly created client connection and starts
/// its task. The caller must hold the tenant's pairing lock; the task
/// releases it when pairing ends.
pub(crate) fn spawn_session(
    ctx: Arc<SessionContext>,
    session_id: u64,
    tenant_id: &str,
    connection: ClientConnection,
    pairing_timeout: Duration,
) -> SpawnedSession {
    let ClientConnection { handle, events } = connection;
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (outcome_tx, outcome_rx) = oneshot::channel();

    let deadline_tx = commands_tx.clone();
    let timer = PairingTimer::arm(pairing_timeout, move || {
        let _ = deadline_tx.send(SessionCommand::PairingDeadline);
    });

    let now = Utc::now();
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
        state: SessionState::Initializing,
        pairing_payload: None,
        pairing_deadline: Some(timer.deadline()),
        created_at: now,
        last_transition_at: now,
        failure: None,
    });

    let entry = Arc::new(SessionEntry {
        session_id,
        tenant_id: tenant_id.to_string(),
        handle: handle.clone(),
        snapshot: snapshot_rx,
        commands: commands_tx,
        active: AtomicBool::new(false),
        messages_sent: AtomicU64::new(0),
    });
    ctx.registry.put(tenant_id, entry.clone());
    info!(tenant_id, session_id, handle = %handle, "session initializing");

    let actor = SessionActor {
        ctx,
        entry: entry.clone(),
        handle: Some(handle),
        machine: ConnectionMachine::new(),
        snapshot: snapshot_tx,
        outcome: Some(outcome_tx),
        timer,
        teardown_waiters: Vec::new(),
    };
    tokio::spawn(actor.run(events, commands_rx));

    SpawnedSession {
        entry,
        outcome: outcome_rx,
    }
}

struct SessionActor {
    ctx: Arc<SessionContext>,
    entry: Arc<SessionEntry>,
    handle: Option<ClientHandle>,
    machine: ConnectionMachine,
    snapshot: watch::Sender<SessionSnapshot>,
    outcome: Option<oneshot::Sender<PairingOutcome>>,
    timer: PairingTimer,
    teardown_waiters: Vec<oneshot::Sender<()>>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ClientEvent>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        loop {
            let input = tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(SessionCommand::Teardown { ack }) => {
                        self.teardown_waiters.extend(ack);
                        SessionInput::Teardown
                    }
                    Some(SessionCommand::PairingDeadline) => SessionInput::PairingDeadline,
                    None => SessionInput::Teardown,
                },
                event = events.recv() => match event {
                    Some(event) => SessionInput::Client(event),
                    None => SessionInput::Client(ClientEvent::Disconnected(
                        "event stream closed".to_string(),
                    )),
                },
            };
            if self.step(input) {
                break;
            }
        }

        // unsubscribe before the handle goes away so late events have nowhere to land
        drop(events);
        self.destroy_handle().await;
        for waiter in self.teardown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        // teardown requests queued behind the terminal transition are answered by
        // dropping their ack senders along with the command queue
        commands.close();
    }

    /// Applies one input. Returns true when the handle must be destroyed.
    fn step(&mut self, input: SessionInput) -> bool {
        let tenant_id = self.entry.tenant_id().to_string();
        let session_id = self.entry.session_id();
        let kind = input_kind(&input);
        let before = self.machine.state();
        let effects = self.machine.apply(input);
        let after = self.machine.state();
        self.publish(before);

        if before != after {
            info!(
                tenant_id = %tenant_id,
                session_id,
                from = %before,
                to = %after,
                trigger = kind,
                "session transition"
            );
        } else if effects.is_empty() {
            debug!(tenant_id = %tenant_id, session_id, state = %after, trigger = kind, "input ignored");
        }

        let mut destroy = false;
        for effect in effects {
            match effect {
                Effect::CancelPairingTimer => {
                    self.timer.cancel();
                }
                Effect::ReleasePairingLock => self.ctx.registry.release(&tenant_id),
                Effect::ResolvePairing(outcome) => {
                    if let PairingOutcome::Failed(reason) = &outcome {
                        warn!(tenant_id = %tenant_id, session_id, %reason, "pairing failed");
                    }
                    if let Some(tx) = self.outcome.take() {
                        let _ = tx.send(outcome);
                    }
                }
                Effect::Activate => {
                    self.entry.active.store(true, Ordering::SeqCst);
                }
                Effect::EnqueueDispatch => {
                    let dispatcher = self.ctx.dispatcher.clone();
                    let tenant_id = tenant_id.clone();
                    tokio::spawn(async move {
                        if let Err(err) = dispatcher.dispatch_pending(&tenant_id).await {
                            warn!(tenant_id = %tenant_id, error = %err, "dispatch after ready failed");
                        }
                    });
                }
                Effect::HandleInbound { from, body } => {
                    let correlator = self.ctx.correlator.clone();
                    let tenant_id = tenant_id.clone();
                    tokio::spawn(async move {
                        if let Err(err) = correlator
                            .on_inbound_message(&tenant_id, &from, &body)
                            .await
                        {
                            warn!(tenant_id = %tenant_id, error = %err, "inbound reply handling failed");
                        }
                    });
                }
                Effect::Deregister => {
                    self.entry.active.store(false, Ordering::SeqCst);
                    self.ctx
                        .registry
                        .finish_session(&tenant_id, session_id, self.entry.status());
                }
                Effect::DestroyHandle => destroy = true,
            }
        }
        destroy
    }

    fn publish(&self, before: SessionState) {
        let state = self.machine.state();
        let payload = self.machine.payload().map(str::to_string);
        let failure = self.machine.failure().cloned();
        self.snapshot.send_modify(|snapshot| {
            if before != state {
                snapshot.last_transition_at = Utc::now();
            }
            snapshot.state = state;
            snapshot.pairing_payload = payload;
            snapshot.failure = failure;
            if !state.is_pairing() {
                snapshot.pairing_deadline = None;
            }
        });
    }

    async fn destroy_handle(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let tenant_id = self.entry.tenant_id();
        match tokio::time::timeout(self.ctx.teardown_timeout, self.ctx.client.destroy(&handle))
            .await
        {
            Ok(Ok(())) => debug!(tenant_id, handle = %handle, "client handle destroyed"),
            Ok(Err(err)) => {
                error!(tenant_id, handle = %handle, error = %err, "client handle teardown failed")
            }
            Err(_) => error!(
                tenant_id,
                handle = %handle,
                timeout_secs = self.ctx.teardown_timeout.as_secs(),
                "client handle teardown timed out"
            ),
        }
    }
}

fn input_kind(input: &SessionInput) -> &'static str {
    match input {
        SessionInput::Client(event) => event.kind(),
        SessionInput::PairingDeadline => "pairing_deadline",
        SessionInput::Teardown => "teardown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        answer::AnswerGenerator, client::MemoryChatClient, error::AppError,
        store::MemoryRecordStore, types::FailureReason,
    };
    use async_trait::async_trait;

    struct NoAnswers;

    #[async_trait]
    impl AnswerGenerator for NoAnswers {
        async fn generate(&self, _: &str, _: &str, _: &str) -> Result<Option<String>, AppError> {
            Ok(None)
        }
    }

    fn context(client: Arc<MemoryChatClient>) -> Arc<SessionContext> {
        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(MemoryRecordStore::new());
        Arc::new(SessionContext {
            dispatcher: Arc::new(Dispatcher::new(
                registry.clone(),
                client.clone(),
                store.clone(),
                Duration::ZERO,
                "c.us",
            )),
            correlator: Arc::new(ReplyCorrelator::new(
                registry.clone(),
                client.clone(),
                store,
                Arc::new(NoAnswers),
            )),
            registry,
            client,
            teardown_timeout: Duration::from_secs(5),
        })
    }

    async fn start(ctx: &Arc<SessionContext>, client: &MemoryChatClient) -> SpawnedSession {
        assert!(ctx.registry.acquire("u1"));
        let connection = client.create("u1").await.expect("create");
        spawn_session(ctx.clone(), 1, "u1", connection, Duration::from_secs(120))
    }

    #[tokio::test]
    async fn functional_concurrent_teardowns_all_return_and_destroy_once() {
        let client = Arc::new(MemoryChatClient::new());
        let ctx = context(client.clone());
        let spawned = start(&ctx, &client).await;
        client.emit("u1", ClientEvent::Ready);
        assert_eq!(spawned.outcome.await.expect("outcome"), PairingOutcome::Ready);

        let entry = spawned.entry;
        let (a, b) = (entry.clone(), entry.clone());
        let first = tokio::spawn(async move { a.teardown().await });
        let second = tokio::spawn(async move { b.teardown().await });
        first.await.expect("first teardown");
        second.await.expect("second teardown");
        entry.teardown().await;

        assert_eq!(client.destroyed().len(), 1);
        assert!(!ctx.registry.contains("u1"));
        assert!(entry.sendable_handle().is_none());
        assert_eq!(entry.state(), SessionState::Disconnected);
        assert!(!entry.request_teardown());
    }

    #[tokio::test]
    async fn regression_event_stream_closing_mid_pairing_is_an_error() {
        let client = Arc::new(MemoryChatClient::new());
        let ctx = context(client.clone());
        let spawned = start(&ctx, &client).await;
        let handle = client.latest_handle("u1").expect("handle");

        // the client dropping its side of the subscription looks like a crash
        client.destroy(&handle).await.expect("destroy");
        assert_eq!(
            spawned.outcome.await.expect("outcome"),
            PairingOutcome::Failed(FailureReason::ClientClosed(
                "event stream closed".to_string()
            ))
        );
        assert!(!ctx.registry.is_locked("u1"));
        assert_eq!(
            ctx.registry.last_outcome("u1").map(|status| status.state),
            Some(SessionState::Error)
        );
    }
}
