//! Outbound dispatch pipeline: flushes a tenant's pending contacts through its
//! ready session, one send at a time.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    client::ChatClient,
    error::AppError,
    prompting::{render_recovery_message, RecoveryMessageContext},
    registry::SessionRegistry,
    store::RecordStore,
    types::{address_for_phone, ContactStatus, DispatchFailure, DispatchOutcome, DispatchReport},
};

pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    client: Arc<dyn ChatClient>,
    store: Arc<dyn RecordStore>,
    send_interval: Duration,
    address_suffix: String,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        client: Arc<dyn ChatClient>,
        store: Arc<dyn RecordStore>,
        send_interval: Duration,
        address_suffix: &str,
    ) -> Self {
        Self {
            registry,
            client,
            store,
            send_interval,
            address_suffix: address_suffix.to_string(),
        }
    }

    /// Runs one pass over the tenant's pending contacts.
    ///
    /// A tenant without a ready session yields `NotConnected` and a pass that
    /// finds another one running yields `AlreadyRunning`; neither is an error.
    /// Per-contact send failures are collected in the report and never stop
    /// the pass. Only a failure to read the pending list is returned as `Err`.
    pub async fn dispatch_pending(&self, tenant_id: &str) -> Result<DispatchReport, AppError> {
        let Some(entry) = self
            .registry
            .get(tenant_id)
            .filter(|entry| entry.sendable_handle().is_some())
        else {
            debug!(tenant_id, "dispatch skipped, no ready session");
            return Ok(DispatchReport::skipped(DispatchOutcome::NotConnected));
        };
        let Some(_slot) = self.registry.try_begin_dispatch(tenant_id) else {
            debug!(tenant_id, "dispatch skipped, pass already running");
            return Ok(DispatchReport::skipped(DispatchOutcome::AlreadyRunning));
        };

        let contacts = self.store.query_pending_contacts(tenant_id).await?;
        let mut report = DispatchReport::skipped(DispatchOutcome::Completed);
        let mut attempted = false;

        for contact in &contacts {
            if attempted && !self.send_interval.is_zero() {
                tokio::time::sleep(self.send_interval).await;
            }
            let Some(handle) = entry.sendable_handle() else {
                warn!(
                    tenant_id,
                    remaining = contacts.len() - report.sent_count - report.failures.len(),
                    "session lost mid-pass, leaving remaining contacts pending"
                );
                report.outcome = DispatchOutcome::Interrupted;
                break;
            };
            let Some(to) = address_for_phone(&contact.phone, &self.address_suffix) else {
                warn!(tenant_id, contact_id = %contact.id, phone = %contact.phone, "contact has no usable phone");
                report.failures.push(DispatchFailure {
                    contact_id: contact.id.clone(),
                    reason: format!("invalid phone '{}'", contact.phone),
                });
                continue;
            };

            let text = render_recovery_message(&RecoveryMessageContext {
                name: &contact.name,
                product: &contact.product,
            });
            attempted = true;
            if let Err(err) = self.client.send(&handle, &to, &text).await {
                warn!(tenant_id, contact_id = %contact.id, error = %err, "recovery message send failed");
                report.failures.push(DispatchFailure {
                    contact_id: contact.id.clone(),
                    reason: err.to_string(),
                });
                continue;
            }

            report.sent_count += 1;
            entry.record_sent();
            if let Err(err) = self
                .store
                .update_contact_status(&contact.id, ContactStatus::Contacted)
                .await
            {
                warn!(tenant_id, contact_id = %contact.id, error = %err, "failed to mark contact as contacted");
            }
            if let Err(err) = self.store.record_message_sent(tenant_id, &contact.id).await {
                warn!(tenant_id, contact_id = %contact.id, error = %err, "failed to record sent message");
            }
        }

        info!(
            tenant_id,
            pending = contacts.len(),
            sent = report.sent_count,
            failed = report.failures.len(),
            outcome = ?report.outcome,
            "dispatch pass finished"
        );
        Ok(report)
    }
}
