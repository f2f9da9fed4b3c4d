// Contact directory.
//
// Source of condition-field values and the target of action-node side
// effects. Action mutations are idempotent by construction: re-applying
// a tag add or a field set converges on the same row state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Point-in-time view of a contact, read once per step execution and
/// passed into the condition evaluator and template renderer.
#[derive(Debug, Clone, Default)]
pub struct ContactSnapshot {
    pub tags: Vec<Uuid>,
    pub custom_fields: serde_json::Value,
    pub last_message_at: Option<DateTime<Utc>>,
    pub status: String,
    pub source: String,
}

/// Side effects an action node can apply to a contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ContactMutation {
    AddTag { tag_id: Uuid },
    RemoveTag { tag_id: Uuid },
    SetField { field: String, value: serde_json::Value },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn contact_context(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
    ) -> EngineResult<ContactSnapshot>;

    async fn apply_mutation(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        mutation: &ContactMutation,
    ) -> EngineResult<()>;

    /// Contacts carrying the given tag; the audience of date_time triggers.
    async fn contacts_with_tag(&self, tenant_id: Uuid, tag_id: Uuid) -> EngineResult<Vec<Uuid>>;

    /// Emit an operator-facing notification about a contact.
    async fn notify(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        title: &str,
        message: &str,
    ) -> EngineResult<()>;
}

/// Postgres-backed directory over the CRM's contact tables.
pub struct PgContactDirectory {
    pool: PgPool,
}

impl PgContactDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContactDirectory for PgContactDirectory {
    async fn contact_context(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
    ) -> EngineResult<ContactSnapshot> {
        let row: Option<(String, String, serde_json::Value, Option<DateTime<Utc>>)> =
            sqlx::query_as(
                "SELECT status, source, custom_fields, last_message_at
                 FROM contacts WHERE id = $1 AND tenant_id = $2",
            )
            .bind(contact_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        let (status, source, custom_fields, last_message_at) = row.ok_or_else(|| {
            EngineError::Directory(format!("contact {} not found", contact_id))
        })?;

        let tags: Vec<(Uuid,)> =
            sqlx::query_as("SELECT tag_id FROM contact_tags WHERE contact_id = $1")
                .bind(contact_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(ContactSnapshot {
            tags: tags.into_iter().map(|t| t.0).collect(),
            custom_fields,
            last_message_at,
            status,
            source,
        })
    }

    async fn apply_mutation(
        &self,
        _tenant_id: Uuid,
        contact_id: Uuid,
        mutation: &ContactMutation,
    ) -> EngineResult<()> {
        match mutation {
            ContactMutation::AddTag { tag_id } => {
                sqlx::query(
                    "INSERT INTO contact_tags (contact_id, tag_id)
                     VALUES ($1, $2)
                     ON CONFLICT DO NOTHING",
                )
                .bind(contact_id)
                .bind(tag_id)
                .execute(&self.pool)
                .await?;
            }
            ContactMutation::RemoveTag { tag_id } => {
                sqlx::query("DELETE FROM contact_tags WHERE contact_id = $1 AND tag_id = $2")
                    .bind(contact_id)
                    .bind(tag_id)
                    .execute(&self.pool)
                    .await?;
            }
            ContactMutation::SetField { field, value } => {
                sqlx::query(
                    "UPDATE contacts
                     SET custom_fields = custom_fields || jsonb_build_object($2::text, $3::jsonb),
                         updated_at = NOW()
                     WHERE id = $1",
                )
                .bind(contact_id)
                .bind(field)
                .bind(value)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    async fn contacts_with_tag(&self, tenant_id: Uuid, tag_id: Uuid) -> EngineResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT ct.contact_id
             FROM contact_tags ct
             JOIN contacts c ON c.id = ct.contact_id
             WHERE ct.tag_id = $1 AND c.tenant_id = $2",
        )
        .bind(tag_id)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn notify(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        title: &str,
        message: &str,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO notifications (id, tenant_id, contact_id, title, message, created_at)
             VALUES ($1, $2, $3, $4, $5, NOW())",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(contact_id)
        .bind(title)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
