use std::collections::BTreeMap;

use sqlx::{sqlite::SqliteRow, Row};

use leadline_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use leadline_core::domain::session::{SessionId, TenantId};

use super::{format_timestamp, parse_label, parse_timestamp, AuditEventRepository, RepositoryError};
use crate::DbPool;

pub struct SqlAuditEventRepository {
    pool: DbPool,
}

impl SqlAuditEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AuditEventRepository for SqlAuditEventRepository {
    async fn save(&self, event: AuditEvent) -> Result<(), RepositoryError> {
        let metadata_json = serde_json::to_string(&event.metadata)
            .map_err(|error| RepositoryError::Decode(format!("audit metadata: {error}")))?;

        sqlx::query(
            "INSERT INTO audit_event (
                id,
                tenant_id,
                session_id,
                correlation_id,
                event_type,
                category,
                actor,
                outcome,
                metadata_json,
                occurred_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING",
        )
        .bind(&event.event_id)
        .bind(event.tenant_id.as_ref().map(|id| id.0.as_str()))
        .bind(event.session_id.as_ref().map(|id| id.0.as_str()))
        .bind(&event.correlation_id)
        .bind(&event.event_type)
        .bind(event.category.as_str())
        .bind(&event.actor)
        .bind(event.outcome.as_str())
        .bind(metadata_json)
        .bind(format_timestamp(event.occurred_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                tenant_id,
                session_id,
                correlation_id,
                event_type,
                category,
                actor,
                outcome,
                metadata_json,
                occurred_at
             FROM audit_event
             WHERE session_id = ?
             ORDER BY occurred_at ASC, rowid ASC",
        )
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(audit_event_from_row).collect()
    }
}

fn audit_event_from_row(row: SqliteRow) -> Result<AuditEvent, RepositoryError> {
    let category_raw = row.try_get::<String, _>("category")?;
    let outcome_raw = row.try_get::<String, _>("outcome")?;
    let metadata_raw = row.try_get::<String, _>("metadata_json")?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid metadata_json `{metadata_raw}` ({error})"))
    })?;

    Ok(AuditEvent {
        event_id: row.try_get("id")?,
        tenant_id: row.try_get::<Option<String>, _>("tenant_id")?.map(TenantId),
        session_id: row.try_get::<Option<String>, _>("session_id")?.map(SessionId),
        correlation_id: row.try_get("correlation_id")?,
        event_type: row.try_get("event_type")?,
        category: parse_label("audit category", &category_raw, AuditCategory::parse)?,
        actor: row.try_get("actor")?,
        outcome: parse_label("audit outcome", &outcome_raw, AuditOutcome::parse)?,
        metadata,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}
