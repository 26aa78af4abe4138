use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::RecordStore;
use crate::{
    error::AppError,
    types::{normalize_phone, now_iso, Contact, ContactStatus, NewContact},
};

const CONTACT_COLUMNS: &str = "id, tenant_id, name, phone, product, status, created_at";

pub struct PgRecordStore {
    db: PgPool,
}

impl PgRecordStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.db).await
    }
}

fn parse_contact_row(row: sqlx::postgres::PgRow) -> Contact {
    let status = row.get::<String, _>("status");
    Contact {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        phone: row.get("phone"),
        product: row.get("product"),
        // rows written by other collaborators may carry unknown values; they never match
        // the pending or replyable filters anyway
        status: ContactStatus::parse(&status).unwrap_or(ContactStatus::Lost),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn query_pending_contacts(&self, tenant_id: &str) -> Result<Vec<Contact>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts \
             WHERE tenant_id = $1 AND status = $2 \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(tenant_id)
        .bind(ContactStatus::Pending.as_str())
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(parse_contact_row).collect())
    }

    async fn find_replyable_contact(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Option<Contact>, AppError> {
        let Some(digits) = normalize_phone(phone) else {
            return Ok(None);
        };
        let row = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts \
             WHERE tenant_id = $1 \
               AND regexp_replace(phone, '[^0-9]', '', 'g') = $2 \
               AND status IN ($3, $4) \
             ORDER BY created_at ASC, id ASC \
             LIMIT 1"
        ))
        .bind(tenant_id)
        .bind(&digits)
        .bind(ContactStatus::Contacted.as_str())
        .bind(ContactStatus::Responded.as_str())
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(parse_contact_row))
    }

    async fn update_contact_status(
        &self,
        contact_id: &str,
        status: ContactStatus,
    ) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE contacts SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(now_iso())
            .bind(contact_id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::ContactNotFound(contact_id.to_string()));
        }
        Ok(())
    }

    async fn record_message_sent(&self, tenant_id: &str, contact_id: &str) -> Result<(), AppError> {
        sqlx::query("INSERT INTO message_stats (tenant_id, contact_id, sent_at) VALUES ($1, $2, $3)")
            .bind(tenant_id)
            .bind(contact_id)
            .bind(now_iso())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_pending_contact(
        &self,
        tenant_id: &str,
        contact: NewContact,
    ) -> Result<Contact, AppError> {
        let now = now_iso();
        let id = contact
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let result = sqlx::query(
            "INSERT INTO contacts (id, tenant_id, name, phone, product, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, phone = EXCLUDED.phone, \
               product = EXCLUDED.product, updated_at = EXCLUDED.updated_at \
             WHERE contacts.tenant_id = EXCLUDED.tenant_id",
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(contact.name.trim())
        .bind(contact.phone.trim())
        .bind(contact.product.trim())
        .bind(ContactStatus::Pending.as_str())
        .bind(&now)
        .execute(&self.db)
        .await?;
        // the conflict guard skips the update when the id is owned by another tenant
        if result.rows_affected() == 0 {
            return Err(AppError::ContactConflict(id));
        }
        let row = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(&id)
        .bind(tenant_id)
        .fetch_one(&self.db)
        .await?;
        Ok(parse_contact_row(row))
    }
}

#[cfg(test)]
mod tests {
    use sqlx::postgres::PgPoolOptions;

    use super::*;

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a scratch postgres database"]
    async fn regression_ingest_never_rewrites_another_tenants_contact() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let db = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .expect("connect");
        let store = PgRecordStore::new(db);
        store.migrate().await.expect("migrate");

        let id = Uuid::new_v4().to_string();
        let new_contact = |name: &str, phone: &str| NewContact {
            id: Some(id.clone()),
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
        assert!(matches!(err, AppError::ContactConflict(_)));

        let pending = store.query_pending_contacts("u1").await.expect("query");
        let kept = pending
            .iter()
            .find(|contact| contact.id == id)
            .expect("contact");
        assert_eq!(kept.name, "Ana");
        assert_eq!(kept.phone, "5511999999999");
        assert!(store
            .query_pending_contacts("u2")
            .await
            .expect("query")
            .iter()
            .all(|contact| contact.id != id));
    }
}
