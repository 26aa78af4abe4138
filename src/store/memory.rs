use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use super::RecordStore;
use crate::{
    error::AppError,
    types::{normalize_phone, now_iso, Contact, ContactStatus, NewContact},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMetric {
    pub tenant_id: String,
    pub contact_id: String,
}

#[derive(Default)]
struct MemoryStoreState {
    contacts: Vec<Contact>,
    sent: Vec<SentMetric>,
}

/// Insertion-ordered store kept in process memory (`STORE_KIND=memory`).
#[derive(Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inserts a contact as-is, including its status.
    pub fn seed(&self, contact: Contact) {
        self.lock().contacts.push(contact);
    }

    pub fn contact(&self, contact_id: &str) -> Option<Contact> {
        self.lock()
            .contacts
            .iter()
            .find(|contact| contact.id == contact_id)
            .cloned()
    }

    pub fn sent_metrics(&self) -> Vec<SentMetric> {
        self.lock().sent.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn query_pending_contacts(&self, tenant_id: &str) -> Result<Vec<Contact>, AppError> {
        Ok(self
            .lock()
            .contacts
            .iter()
            .filter(|contact| {
                contact.tenant_id == tenant_id && contact.status == ContactStatus::Pending
            })
            .cloned()
            .collect())
    }

    async fn find_replyable_contact(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Option<Contact>, AppError> {
        let Some(digits) = normalize_phone(phone) else {
            return Ok(None);
        };
        Ok(self
            .lock()
            .contacts
            .iter()
            .find(|contact| {
                contact.tenant_id == tenant_id
                    && contact.status.accepts_replies()
                    && normalize_phone(&contact.phone).as_deref() == Some(digits.as_str())
            })
            .cloned())
    }

    async fn update_contact_status(
        &self,
        contact_id: &str,
        status: ContactStatus,
    ) -> Result<(), AppError> {
        let mut state = self.lock();
        let contact = state
            .contacts
            .iter_mut()
            .find(|contact| contact.id == contact_id)
            .ok_or_else(|| AppError::ContactNotFound(contact_id.to_string()))?;
        contact.status = status;
        Ok(())
    }

    async fn record_message_sent(&self, tenant_id: &str, contact_id: &str) -> Result<(), AppError> {
        self.lock().sent.push(SentMetric {
            tenant_id: tenant_id.to_string(),
            contact_id: contact_id.to_string(),
        });
        Ok(())
    }

    async fn insert_pending_contact(
        &self,
        tenant_id: &str,
        contact: NewContact,
    ) -> Result<Contact, AppError> {
        let id = contact
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut state = self.lock();
        if let Some(existing) = state.contacts.iter_mut().find(|existing| existing.id == id) {
            if existing.tenant_id != tenant_id {
                return Err(AppError::ContactConflict(id));
            }
            existing.name = contact.name.trim().to_string();
            existing.phone = contact.phone.trim().to_string();
            existing.product = contact.product.trim().to_string();
            return Ok(existing.clone());
        }
        let stored = Contact {
            id,
            tenant_id: tenant_id.to_string(),
            name: contact.name.trim().to_string(),
            phone: contact.phone.trim().to_string(),
            product: contact.product.trim().to_string(),
            status: ContactStatus::Pending,
            created_at: now_iso(),
        };
        state.contacts.push(stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(id: &str, tenant: &str, phone: &str, status: ContactStatus) -> Contact {
        Contact {
            id: id.to_string(),
            tenant_id: tenant.to_string(),
            name: format!("name-{id}"),
            phone: phone.to_string(),
            product: "sneakers".to_string(),
            status,
            created_at: now_iso(),
        }
    }

    #[tokio::test]
    async fn functional_pending_query_is_tenant_scoped_and_ordered() {
        let store = MemoryRecordStore::new();
        store.seed(contact("a", "u1", "1", ContactStatus::Pending));
        store.seed(contact("b", "u2", "2", ContactStatus::Pending));
        store.seed(contact("c", "u1", "3", ContactStatus::Contacted));
        store.seed(contact("d", "u1", "4", ContactStatus::Pending));

        let pending = store.query_pending_contacts("u1").await.expect("query");
        let ids = pending.iter().map(|c| c.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "d"]);
    }

    #[tokio::test]
    async fn functional_replyable_lookup_matches_formatted_phones_only_after_contact() {
        let store = MemoryRecordStore::new();
        store.seed(contact("p", "u1", "+55 11 99999-9999", ContactStatus::Pending));
        store.seed(contact("c", "u1", "+55 11 99999-9999", ContactStatus::Contacted));

        let found = store
            .find_replyable_contact("u1", "5511999999999")
            .await
            .expect("lookup");
        assert_eq!(found.map(|c| c.id), Some("c".to_string()));
        assert!(store
            .find_replyable_contact("u2", "5511999999999")
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn regression_ingest_never_rewrites_another_tenants_contact() {
        let store = MemoryRecordStore::new();
        let new_contact = |name: &str, phone: &str| NewContact {
            id: Some("order-1".to_string()),
            name: name.to_string(),
            phone: phone.to_string(),
            product: "sneakers".to_string(),
        };
        store
            .insert_pending_contact("u1", new_contact("Ana", "5511999999999"))
            .await
            .expect("insert");

        let err = store
            .insert_pending_contact("u2", new_contact("Eve", "5511000000000"))
            .await
            .expect_err("foreign id");
        assert!(matches!(err, AppError::ContactConflict(id) if id == "order-1"));

        let kept = store.contact("order-1").expect("contact");
        assert_eq!(kept.tenant_id, "u1");
        assert_eq!(kept.name, "Ana");
        assert_eq!(kept.phone, "5511999999999");

        let updated = store
            .insert_pending_contact("u1", new_contact("Ana Maria", "5511999999999"))
            .await
            .expect("same-tenant upsert");
        assert_eq!(updated.name, "Ana Maria");
    }

    #[tokio::test]
    async fn regression_updating_unknown_contact_is_reported() {
        let store = MemoryRecordStore::new();
        let err = store
            .update_contact_status("missing", ContactStatus::Contacted)
            .await
            .expect_err("missing contact");
        assert!(matches!(err, AppError::ContactNotFound(id) if id == "missing"));
    }
}
