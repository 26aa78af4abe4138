//! Inbound reply correlator: ties a customer's reply back to the contact it
//! answers, asks the answer generator for a response and advances the contact.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    answer::AnswerGenerator,
    client::ChatClient,
    error::AppError,
    registry::SessionRegistry,
    store::RecordStore,
    types::{phone_from_address, ContactStatus},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Group, broadcast or otherwise unusable sender address.
    Ignored,
    NoContact,
    Handled { contact_id: String, replied: bool },
}

pub struct ReplyCorrelator {
    registry: Arc<SessionRegistry>,
    client: Arc<dyn ChatClient>,
    store: Arc<dyn RecordStore>,
    answers: Arc<dyn AnswerGenerator>,
}

impl ReplyCorrelator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        client: Arc<dyn ChatClient>,
        store: Arc<dyn RecordStore>,
        answers: Arc<dyn AnswerGenerator>,
    ) -> Self {
        Self {
            registry,
            client,
            store,
            answers,
        }
    }

    /// Handles one inbound message. Answer and send failures are logged and
    /// only cost the reply; the matched contact is marked responded regardless.
    pub async fn on_inbound_message(
        &self,
        tenant_id: &str,
        from: &str,
        body: &str,
    ) -> Result<InboundOutcome, AppError> {
        let Some(phone) = phone_from_address(from) else {
            debug!(tenant_id, from, "ignoring inbound message from non-customer address");
            return Ok(InboundOutcome::Ignored);
        };
        let Some(contact) = self.store.find_replyable_contact(tenant_id, &phone).await? else {
            debug!(tenant_id, phone = %phone, "inbound message matches no contacted customer");
            return Ok(InboundOutcome::NoContact);
        };

        let answer = match self
            .answers
            .generate(&contact.name, &contact.product, body)
            .await
        {
            Ok(answer) => answer,
            Err(err) => {
                warn!(tenant_id, contact_id = %contact.id, error = %err, "answer generation failed, skipping reply");
                None
            }
        };

        let mut replied = false;
        match answer {
            Some(text) if !text.trim().is_empty() => {
                match self.reply(tenant_id, &contact.id, from, &text).await {
                    Ok(()) => replied = true,
                    Err(err) => {
                        warn!(tenant_id, contact_id = %contact.id, error = %err, "reply not delivered")
                    }
                }
            }
            _ => debug!(tenant_id, contact_id = %contact.id, "no answer to send"),
        }

        self.store
            .update_contact_status(&contact.id, ContactStatus::Responded)
            .await?;
        info!(tenant_id, contact_id = %contact.id, replied, "customer reply handled");
        Ok(InboundOutcome::Handled {
            contact_id: contact.id,
            replied,
        })
    }

    async fn reply(
        &self,
        tenant_id: &str,
        contact_id: &str,
        to: &str,
        text: &str,
    ) -> Result<(), AppError> {
        let (entry, handle) = self
            .registry
            .get(tenant_id)
            .and_then(|entry| {
                let handle = entry.sendable_handle()?;
                Some((entry, handle))
            })
            .ok_or_else(|| AppError::NotConnected(tenant_id.to_string()))?;
        self.client.send(&handle, to, text).await?;
        entry.record_sent();
        if let Err(err) = self.store.record_message_sent(tenant_id, contact_id).await {
            warn!(tenant_id, contact_id, error = %err, "failed to record sent reply");
        }
        Ok(())
    }
}
