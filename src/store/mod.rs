//! Record store seam: contacts and message-sent metrics live outside the core.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::{
    error::AppError,
    types::{Contact, ContactStatus, NewContact},
};

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Pending contacts for `tenant_id`, oldest first.
    async fn query_pending_contacts(&self, tenant_id: &str) -> Result<Vec<Contact>, AppError>;

    /// First contact of `tenant_id` with this phone whose status accepts replies.
    async fn find_replyable_contact(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Option<Contact>, AppError>;

    async fn update_contact_status(
        &self,
        contact_id: &str,
        status: ContactStatus,
    ) -> Result<(), AppError>;

    async fn record_message_sent(&self, tenant_id: &str, contact_id: &str) -> Result<(), AppError>;

    async fn insert_pending_contact(
        &self,
        tenant_id: &str,
        contact: NewContact,
    ) -> Result<Contact, AppError>;
}
