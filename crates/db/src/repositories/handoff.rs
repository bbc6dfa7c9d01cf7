use sqlx::{sqlite::SqliteRow, Row};

use leadline_core::domain::bot::ConversationState;
use leadline_core::domain::handoff::{HandoffEvent, HandoffEventId, HandoffOutcome};
use leadline_core::domain::session::{SessionId, TenantId};

use super::{parse_label, parse_timestamp, HandoffEventRepository, RepositoryError};
use crate::DbPool;

pub struct SqlHandoffEventRepository {
    pool: DbPool,
}

impl SqlHandoffEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl HandoffEventRepository for SqlHandoffEventRepository {
    async fn find_by_id(
        &self,
        id: &HandoffEventId,
    ) -> Result<Option<HandoffEvent>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                session_id,
                tenant_id,
                from_state,
                to_state,
                confidence,
                threshold_used,
                rejected,
                fallback,
                outcome,
                occurred_at
             FROM handoff_event
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(event_from_row).transpose()
    }

    async fn set_outcome(
        &self,
        id: &HandoffEventId,
        outcome: HandoffOutcome,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE handoff_event
             SET outcome = ?
             WHERE id = ? AND outcome = 'pending'",
        )
        .bind(outcome.as_str())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<HandoffEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                session_id,
                tenant_id,
                from_state,
                to_state,
                confidence,
                threshold_used,
                rejected,
                fallback,
                outcome,
                occurred_at
             FROM handoff_event
             WHERE session_id = ?
             ORDER BY sequence ASC",
        )
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }
}

pub(crate) fn event_from_row(row: SqliteRow) -> Result<HandoffEvent, RepositoryError> {
    let from_raw = row.try_get::<String, _>("from_state")?;
    let to_raw = row.try_get::<String, _>("to_state")?;
    let outcome_raw = row.try_get::<String, _>("outcome")?;

    Ok(HandoffEvent {
        id: HandoffEventId(row.try_get("id")?),
        session_id: SessionId(row.try_get("session_id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        from_state: parse_label("conversation state", &from_raw, ConversationState::parse)?,
        to_state: parse_label("conversation state", &to_raw, ConversationState::parse)?,
        confidence: row.try_get("confidence")?,
        threshold_used: row.try_get("threshold_used")?,
        rejected: row.try_get("rejected")?,
        fallback: row.try_get("fallback")?,
        outcome: parse_label("handoff outcome", &outcome_raw, HandoffOutcome::parse)?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}
