//! Tenant-facing session operations: pairing, status, disconnect, resend and
//! contact ingestion, plus process shutdown.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::{
    answer::AnswerGenerator,
    client::ChatClient,
    config::SessionSettings,
    correlator::ReplyCorrelator,
    dispatch::Dispatcher,
    error::AppError,
    machine::PairingOutcome,
    registry::SessionRegistry,
    session::{spawn_session, SessionContext},
    store::RecordStore,
    types::{
        normalize_phone, Contact, DispatchOutcome, FailureReason, NewContact, PairingResponse,
        ResendResponse, SessionState, SessionStatus,
    },
};

pub struct SessionManager {
    ctx: Arc<SessionContext>,
    store: Arc<dyn RecordStore>,
    settings: SessionSettings,
    next_session_id: AtomicU64,
}

impl SessionManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        client: Arc<dyn ChatClient>,
        store: Arc<dyn RecordStore>,
        answers: Arc<dyn AnswerGenerator>,
        settings: SessionSettings,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            client.clone(),
            store.clone(),
            settings.send_interval,
            &settings.address_suffix,
        ));
        let correlator = Arc::new(ReplyCorrelator::new(
            registry.clone(),
            client.clone(),
            store.clone(),
            answers,
        ));
        let ctx = Arc::new(SessionContext {
            registry,
            client,
            dispatcher,
            correlator,
            teardown_timeout: settings.teardown_timeout,
        });
        Self {
            ctx,
            store,
            settings,
            next_session_id: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.ctx.dispatcher
    }

    /// Starts pairing for a tenant and waits for the first pairing result.
    ///
    /// Resolves with the pairing payload as soon as the client publishes one,
    /// or with `Ready` when the client authenticates without a scan. Fails
    /// fast with `LockContention` while another pairing for the tenant is in
    /// flight. A ready session for the tenant is torn down before the new
    /// client is created.
    pub async fn start_pairing(&self, tenant_id: &str) -> Result<PairingResponse, AppError> {
        let tenant_id = validate_tenant(tenant_id)?;
        let registry = &self.ctx.registry;
        let Some(lock) = registry.try_lock_pairing(tenant_id) else {
            return Err(AppError::LockContention(tenant_id.to_string()));
        };

        if let Some(existing) = registry.get(tenant_id) {
            info!(tenant_id, session_id = existing.session_id(), "superseding existing session");
            existing.teardown().await;
            registry.remove_session(tenant_id, existing.session_id());
        }
        registry.clear_outcome(tenant_id);

        let connection = self.ctx.client.create(tenant_id).await?;
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
        let spawned = spawn_session(
            self.ctx.clone(),
            session_id,
            tenant_id,
            connection,
            self.settings.pairing_timeout,
        );
        lock.handoff();

        match spawned.outcome.await {
            Ok(PairingOutcome::Payload(payload)) => Ok(PairingResponse {
                state: SessionState::AwaitingScan,
                pairing_payload: Some(payload),
            }),
            Ok(PairingOutcome::Ready) => Ok(PairingResponse {
                state: SessionState::Ready,
                pairing_payload: None,
            }),
            Ok(PairingOutcome::Failed(FailureReason::PairingTimeout)) => {
                Err(AppError::PairingTimeout(self.settings.pairing_timeout))
            }
            Ok(PairingOutcome::Failed(FailureReason::AuthenticationFailure(message))) => {
                Err(AppError::AuthenticationFailure(message))
            }
            Ok(PairingOutcome::Failed(reason)) => Err(AppError::PairingAborted(reason.to_string())),
            Err(_) => Err(AppError::PairingAborted(
                "session task ended without a pairing result".to_string(),
            )),
        }
    }

    /// Live status when a session exists, otherwise how the last one ended.
    pub fn get_status(&self, tenant_id: &str) -> Result<SessionStatus, AppError> {
        let tenant_id = validate_tenant(tenant_id)?;
        let registry = &self.ctx.registry;
        if let Some(entry) = registry.get(tenant_id) {
            return Ok(entry.status());
        }
        Ok(registry
            .last_outcome(tenant_id)
            .unwrap_or_else(|| SessionStatus::disconnected(tenant_id)))
    }

    /// Tears down the tenant's session, if any, and waits for the handle to
    /// be destroyed. Calling it again is a no-op.
    pub async fn disconnect(&self, tenant_id: &str) -> Result<SessionStatus, AppError> {
        let tenant_id = validate_tenant(tenant_id)?;
        let registry = &self.ctx.registry;
        if let Some(entry) = registry.get(tenant_id) {
            entry.teardown().await;
            registry.remove_session(tenant_id, entry.session_id());
            info!(tenant_id, session_id = entry.session_id(), "session disconnected");
        }
        registry.clear_outcome(tenant_id);
        Ok(SessionStatus::disconnected(tenant_id))
    }

    pub async fn resend_pending(&self, tenant_id: &str) -> Result<ResendResponse, AppError> {
        let tenant_id = validate_tenant(tenant_id)?;
        let report = self.ctx.dispatcher.dispatch_pending(tenant_id).await?;
        let message = match report.outcome {
            DispatchOutcome::Completed => format!("sent {} recovery messages", report.sent_count),
            DispatchOutcome::NotConnected => {
                "no ready session; pending contacts will be sent once pairing completes".to_string()
            }
            DispatchOutcome::AlreadyRunning => "a dispatch pass is already running".to_string(),
            DispatchOutcome::Interrupted => format!(
                "session lost after {} messages; remaining contacts stay pending",
                report.sent_count
            ),
        };
        Ok(ResendResponse {
            sent_count: report.sent_count,
            message,
            outcome: report.outcome,
            failures: report.failures,
        })
    }

    /// Stores a pending contact and, when the tenant is ready, kicks off a
    /// dispatch pass in the background.
    pub async fn ingest_contact(
        &self,
        tenant_id: &str,
        contact: NewContact,
    ) -> Result<Contact, AppError> {
        let tenant_id = validate_tenant(tenant_id)?;
        if normalize_phone(&contact.phone).is_none() {
            return Err(AppError::InvalidRequest(format!(
                "phone '{}' contains no digits",
                contact.phone
            )));
        }
        let stored = self.store.insert_pending_contact(tenant_id, contact).await?;
        info!(tenant_id, contact_id = %stored.id, "pending contact stored");

        let ready = self
            .ctx
            .registry
            .get(tenant_id)
            .is_some_and(|entry| entry.state() == SessionState::Ready);
        if ready {
            let dispatcher = self.ctx.dispatcher.clone();
            let tenant_id = tenant_id.to_string();
            tokio::spawn(async move {
                if let Err(err) = dispatcher.dispatch_pending(&tenant_id).await {
                    warn!(tenant_id = %tenant_id, error = %err, "dispatch after ingestion failed");
                }
            });
        }
        Ok(stored)
    }

    /// Tears down every live session and waits for their handles.
    pub async fn shutdown(&self) {
        let sessions = self.ctx.registry.sessions();
        if sessions.is_empty() {
            return;
        }
        info!(sessions = sessions.len(), "tearing down live sessions");
        join_all(sessions.iter().map(|entry| entry.teardown())).await;
        for entry in sessions {
            self.ctx
                .registry
                .remove_session(entry.tenant_id(), entry.session_id());
        }
    }
}

fn validate_tenant(tenant_id: &str) -> Result<&str, AppError> {
    let tenant_id = tenant_id.trim();
    if tenant_id.is_empty() {
        return Err(AppError::InvalidRequest("tenant id is required".to_string()));
    }
    Ok(tenant_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::{ClientEvent, MemoryChatClient},
        store::MemoryRecordStore,
        types::ContactStatus,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoAnswers;

    #[async_trait]
    impl AnswerGenerator for EchoAnswers {
        async fn generate(
            &self,
            _customer_name: &str,
            _product_name: &str,
            inbound_text: &str,
        ) -> Result<Option<String>, AppError> {
            Ok(Some(format!("re: {inbound_text}")))
        }
    }

    struct Fixture {
        client: Arc<MemoryChatClient>,
        store: Arc<MemoryRecordStore>,
        manager: Arc<SessionManager>,
    }

    fn fixture() -> Fixture {
        let client = Arc::new(MemoryChatClient::new());
        let store = Arc::new(MemoryRecordStore::new());
        let manager = Arc::new(SessionManager::new(
            Arc::new(SessionRegistry::new()),
            client.clone(),
            store.clone(),
            Arc::new(EchoAnswers),
            SessionSettings {
                pairing_timeout: Duration::from_secs(120),
                teardown_timeout: Duration::from_secs(5),
                send_interval: Duration::ZERO,
                address_suffix: "c.us".to_string(),
            },
        ));
        Fixture {
            client,
            store,
            manager,
        }
    }

    fn spawn_pairing(
        fx: &Fixture,
        tenant_id: &str,
    ) -> tokio::task::JoinHandle<Result<PairingResponse, AppError>> {
        let manager = fx.manager.clone();
        let tenant_id = tenant_id.to_string();
        tokio::spawn(async move { manager.start_pairing(&tenant_id).await })
    }

    async fn wait_for_state(fx: &Fixture, tenant_id: &str, state: SessionState) {
        let entry = fx.manager.registry().get(tenant_id).expect("session");
        let mut snapshots = entry.subscribe();
        snapshots
            .wait_for(|snapshot| snapshot.state == state)
            .await
            .expect("session task alive");
    }

    /// Pairs `tenant_id` through a payload and a ready event.
    async fn pair(fx: &Fixture, tenant_id: &str, attempt: usize) {
        let pairing = spawn_pairing(fx, tenant_id);
        fx.client.wait_for_created(tenant_id, attempt).await;
        fx.client
            .emit(tenant_id, ClientEvent::PairingPayload(format!("qr-{attempt}")));
        pairing.await.expect("join").expect("pairing");
        fx.client.emit(tenant_id, ClientEvent::Ready);
        wait_for_state(fx, tenant_id, SessionState::Ready).await;
    }

    fn pending(id: &str, tenant_id: &str, phone: &str) -> Contact {
        Contact {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            name: "Ana".to_string(),
            phone: phone.to_string(),
            product: "Bolsa".to_string(),
            status: ContactStatus::Pending,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    async fn settle(mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn functional_pairing_walks_initializing_awaiting_scan_ready() {
        let fx = fixture();
        assert_eq!(fx.manager.get_status("u1").expect("status").state, SessionState::Disconnected);

        let pairing = spawn_pairing(&fx, "u1");
        fx.client.wait_for_created("u1", 1).await;
        assert_eq!(fx.manager.get_status("u1").expect("status").state, SessionState::Initializing);
        assert!(fx.manager.get_status("u1").expect("status").pairing_deadline.is_some());

        fx.client
            .emit("u1", ClientEvent::PairingPayload("qr-payload".to_string()));
        let response = pairing.await.expect("join").expect("pairing");
        assert_eq!(response.state, SessionState::AwaitingScan);
        assert_eq!(response.pairing_payload.as_deref(), Some("qr-payload"));
        let status = fx.manager.get_status("u1").expect("status");
        assert_eq!(status.state, SessionState::AwaitingScan);
        assert_eq!(status.pairing_payload.as_deref(), Some("qr-payload"));

        fx.client.emit("u1", ClientEvent::Ready);
        wait_for_state(&fx, "u1", SessionState::Ready).await;
        let status = fx.manager.get_status("u1").expect("status");
        assert_eq!(status.pairing_payload, None);
        assert_eq!(status.pairing_deadline, None);
        assert!(fx.manager.registry().contains("u1"));
        assert!(!fx.manager.registry().is_locked("u1"));
    }

    #[tokio::test]
    async fn functional_ready_without_scan_resolves_ready() {
        let fx = fixture();
        let pairing = spawn_pairing(&fx, "u1");
        fx.client.wait_for_created("u1", 1).await;
        fx.client.emit("u1", ClientEvent::Ready);
        let response = pairing.await.expect("join").expect("pairing");
        assert_eq!(response.state, SessionState::Ready);
        assert_eq!(response.pairing_payload, None);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_pairing_deadline_errors_and_frees_the_tenant() {
        let fx = fixture();
        let err = fx.manager.start_pairing("u1").await.expect_err("timeout");
        assert!(matches!(err, AppError::PairingTimeout(window) if window == Duration::from_secs(120)));
        assert!(!fx.manager.registry().contains("u1"));
        assert!(!fx.manager.registry().is_locked("u1"));

        let status = fx.manager.get_status("u1").expect("status");
        assert_eq!(status.state, SessionState::Error);
        assert_eq!(status.failure.as_deref(), Some("pairing timed out"));
        settle(|| fx.client.destroyed().len() == 1).await;

        let pairing = spawn_pairing(&fx, "u1");
        fx.client.wait_for_created("u1", 2).await;
        assert_eq!(fx.manager.get_status("u1").expect("status").state, SessionState::Initializing);
        fx.client
            .emit("u1", ClientEvent::PairingPayload("qr-2".to_string()));
        assert!(pairing.await.expect("join").is_ok());
    }

    #[tokio::test]
    async fn unit_second_pairing_while_in_flight_is_lock_contention() {
        let fx = fixture();
        let first = spawn_pairing(&fx, "u1");
        fx.client.wait_for_created("u1", 1).await;

        let err = fx.manager.start_pairing("u1").await.expect_err("contention");
        assert!(matches!(err, AppError::LockContention(tenant) if tenant == "u1"));
        assert_eq!(fx.client.created_count("u1"), 1);

        fx.client
            .emit("u1", ClientEvent::PairingPayload("qr-1".to_string()));
        assert!(first.await.expect("join").is_ok());
        // still pairing until ready
        assert!(matches!(
            fx.manager.start_pairing("u1").await,
            Err(AppError::LockContention(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn regression_concurrent_pairing_keeps_one_session_per_tenant() {
        let fx = fixture();
        let attempts = (0..16).map(|_| spawn_pairing(&fx, "u1")).collect::<Vec<_>>();
        fx.client.wait_for_created("u1", 1).await;
        fx.client
            .emit("u1", ClientEvent::PairingPayload("qr".to_string()));

        let mut succeeded = 0;
        let mut contended = 0;
        for attempt in attempts {
            match attempt.await.expect("join") {
                Ok(_) => succeeded += 1,
                Err(AppError::LockContention(_)) => contended += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(succeeded, 1);
        assert_eq!(contended, 15);
        assert_eq!(fx.client.created_count("u1"), 1);
        assert_eq!(fx.manager.registry().len(), 1);
    }

    #[tokio::test]
    async fn functional_auth_failure_surfaces_and_is_reported_until_cleared() {
        let fx = fixture();
        let pairing = spawn_pairing(&fx, "u1");
        fx.client.wait_for_created("u1", 1).await;
        fx.client
            .emit("u1", ClientEvent::AuthFailure("credentials rejected".to_string()));

        let err = pairing.await.expect("join").expect_err("auth failure");
        assert!(matches!(err, AppError::AuthenticationFailure(message) if message == "credentials rejected"));
        assert!(!fx.manager.registry().is_locked("u1"));
        let status = fx.manager.get_status("u1").expect("status");
        assert_eq!(status.state, SessionState::Error);
        assert!(status.failure.unwrap_or_default().contains("credentials rejected"));

        fx.manager.disconnect("u1").await.expect("disconnect");
        assert_eq!(fx.manager.get_status("u1").expect("status").state, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn functional_disconnect_is_idempotent() {
        let fx = fixture();
        pair(&fx, "u1", 1).await;
        let handle = fx.client.latest_handle("u1").expect("handle");

        fx.manager.disconnect("u1").await.expect("first disconnect");
        assert!(!fx.manager.registry().contains("u1"));
        assert_eq!(fx.client.destroyed(), vec![handle]);

        let status = fx.manager.disconnect("u1").await.expect("second disconnect");
        assert_eq!(status.state, SessionState::Disconnected);
        assert!(!fx.manager.registry().contains("u1"));
        assert_eq!(fx.client.destroyed().len(), 1);
    }

    #[tokio::test]
    async fn regression_disconnect_during_pairing_aborts_the_caller() {
        let fx = fixture();
        let pairing = spawn_pairing(&fx, "u1");
        fx.client.wait_for_created("u1", 1).await;

        fx.manager.disconnect("u1").await.expect("disconnect");
        let err = pairing.await.expect("join").expect_err("aborted");
        assert!(matches!(err, AppError::PairingAborted(_)));
        assert!(!fx.manager.registry().is_locked("u1"));
        assert!(!fx.manager.registry().contains("u1"));
    }

    #[tokio::test]
    async fn functional_repairing_supersedes_the_ready_session() {
        let fx = fixture();
        pair(&fx, "u1", 1).await;
        let first = fx.client.latest_handle("u1").expect("handle");
        let first_session = fx.manager.registry().get("u1").expect("session").session_id();

        let pairing = spawn_pairing(&fx, "u1");
        fx.client.wait_for_created("u1", 2).await;
        assert_eq!(fx.client.destroyed(), vec![first]);
        let current = fx.manager.registry().get("u1").expect("session");
        assert_ne!(current.session_id(), first_session);

        fx.client
            .emit("u1", ClientEvent::PairingPayload("qr-2".to_string()));
        assert!(pairing.await.expect("join").is_ok());
        assert_eq!(fx.manager.registry().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn regression_deadline_after_ready_is_ignored() {
        let fx = fixture();
        pair(&fx, "u1", 1).await;
        let entry = fx.manager.registry().get("u1").expect("session");

        assert!(entry.inject_pairing_deadline());
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(fx.manager.get_status("u1").expect("status").state, SessionState::Ready);
        assert!(fx.manager.get_status("u1").expect("status").failure.is_none());
        assert!(fx.client.destroyed().is_empty());
    }

    #[tokio::test]
    async fn functional_ready_flushes_pending_contacts_and_answers_replies() {
        let fx = fixture();
        fx.store.seed(pending("c1", "u1", "5511999999999"));
        fx.store.seed(pending("c2", "u1", "5511888888888"));
        pair(&fx, "u1", 1).await;

        settle(|| fx.client.sent().len() == 2).await;
        assert_eq!(fx.store.contact("c1").map(|c| c.status), Some(ContactStatus::Contacted));
        assert_eq!(fx.manager.get_status("u1").expect("status").messages_sent, 2);

        fx.client.emit(
            "u1",
            ClientEvent::InboundMessage {
                from: "5511999999999@c.us".to_string(),
                body: "is it still available?".to_string(),
            },
        );
        settle(|| fx.client.sent().len() == 3).await;
        assert_eq!(fx.client.sent()[2].text, "re: is it still available?");
        settle(|| fx.store.contact("c1").map(|c| c.status) == Some(ContactStatus::Responded)).await;
    }

    #[tokio::test]
    async fn functional_resend_reports_each_outcome() {
        let fx = fixture();
        fx.store.seed(pending("c1", "u1", "5511999999999"));
        let response = fx.manager.resend_pending("u1").await.expect("resend");
        assert_eq!(response.outcome, DispatchOutcome::NotConnected);
        assert_eq!(response.sent_count, 0);

        pair(&fx, "u1", 1).await;
        settle(|| fx.client.sent().len() == 1).await;
        settle(|| !fx.manager.registry().is_dispatching("u1")).await;
        fx.store.seed(pending("c2", "u1", "5511888888888"));
        let response = fx.manager.resend_pending("u1").await.expect("resend");
        assert_eq!(response.outcome, DispatchOutcome::Completed);
        assert_eq!(response.sent_count, 1);
        assert_eq!(response.message, "sent 1 recovery messages");
    }

    #[tokio::test]
    async fn functional_ingested_contact_is_validated_and_dispatched_when_ready() {
        let fx = fixture();
        let err = fx
            .manager
            .ingest_contact(
                "u1",
                NewContact {
                    id: None,
                    name: "Ana".to_string(),
                    phone: "unknown".to_string(),
                    product: "Bolsa".to_string(),
                },
            )
            .await
            .expect_err("invalid phone");
        assert!(matches!(err, AppError::InvalidRequest(_)));

        pair(&fx, "u1", 1).await;
        let stored = fx
            .manager
            .ingest_contact(
                "u1",
                NewContact {
                    id: Some("order-42".to_string()),
                    name: "Ana".to_string(),
                    phone: "+55 11 97777-7777".to_string(),
                    product: "Bolsa".to_string(),
                },
            )
            .await
            .expect("ingest");
        assert_eq!(stored.id, "order-42");
        settle(|| fx.store.contact("order-42").map(|c| c.status) == Some(ContactStatus::Contacted))
            .await;
        assert_eq!(fx.client.sent()[0].to, "5511977777777@c.us");
    }

    #[tokio::test]
    async fn regression_failed_client_create_releases_the_pairing_lock() {
        let fx = fixture();
        fx.client.set_fail_create(true);
        let err = fx.manager.start_pairing("u1").await.expect_err("create fails");
        assert!(matches!(err, AppError::Client(_)));
        assert!(!fx.manager.registry().is_locked("u1"));
        assert!(!fx.manager.registry().contains("u1"));

        fx.client.set_fail_create(false);
        let pairing = spawn_pairing(&fx, "u1");
        fx.client.wait_for_created("u1", 1).await;
        fx.client
            .emit("u1", ClientEvent::PairingPayload("qr-retry".to_string()));
        let response = pairing.await.expect("join").expect("pairing");
        assert_eq!(response.pairing_payload.as_deref(), Some("qr-retry"));
    }

    #[tokio::test]
    async fn regression_late_event_from_superseded_handle_is_dropped() {
        let fx = fixture();
        pair(&fx, "u1", 1).await;
        let first = fx.client.latest_handle("u1").expect("handle");

        let pairing = spawn_pairing(&fx, "u1");
        fx.client.wait_for_created("u1", 2).await;
        assert!(!fx.client.emit_to(&first, ClientEvent::Ready));
        assert_eq!(
            fx.manager.get_status("u1").expect("status").state,
            SessionState::Initializing
        );

        let second = fx.client.latest_handle("u1").expect("handle");
        assert!(fx
            .client
            .emit_to(&second, ClientEvent::PairingPayload("qr-2".to_string())));
        assert!(pairing.await.expect("join").is_ok());
    }

    #[tokio::test]
    async fn unit_status_lookup_trims_the_tenant_id() {
        let fx = fixture();
        pair(&fx, "u1", 1).await;
        assert_eq!(
            fx.manager.get_status(" u1 ").expect("status").state,
            SessionState::Ready
        );
        let err = fx.manager.get_status("  ").expect_err("blank tenant");
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn functional_shutdown_tears_down_every_session() {
        let fx = fixture();
        pair(&fx, "u1", 1).await;
        pair(&fx, "u2", 1).await;

        fx.manager.shutdown().await;
        assert!(fx.manager.registry().is_empty());
        assert_eq!(fx.client.destroyed().len(), 2);
    }
}
