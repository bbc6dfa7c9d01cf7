use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use leadline_core::domain::bot::{Channel, ConversationState};
use leadline_core::domain::compliance::ViolationType;
use leadline_core::domain::session::{
    ComplianceState, ContactId, ConversationSession, SessionId, TenantId,
};

use super::handoff::event_from_row;
use super::{
    format_timestamp, parse_label, parse_optional_timestamp, parse_timestamp, parse_u32,
    RepositoryError, SessionRepository,
};
use crate::DbPool;

pub struct SqlSessionRepository {
    pool: DbPool,
}

impl SqlSessionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SessionRepository for SqlSessionRepository {
    async fn find_by_id(
        &self,
        id: &SessionId,
    ) -> Result<Option<ConversationSession>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                tenant_id,
                contact_id,
                channel,
                state,
                created_at,
                last_activity_at,
                compliance_flags_json,
                ai_disclosure_sent,
                recording_notice_sent,
                opted_out,
                automated_messages_sent,
                needs_human_review,
                archived_at
             FROM conversation_session
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(mut session) = row.map(session_from_row).transpose()? else {
            return Ok(None);
        };

        let events = sqlx::query(
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
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;
        session.handoff_history =
            events.into_iter().map(event_from_row).collect::<Result<Vec<_>, _>>()?;

        Ok(Some(session))
    }

    async fn save(&self, session: ConversationSession) -> Result<(), RepositoryError> {
        let flags: Vec<&str> = session.compliance_flags.iter().map(|flag| flag.as_str()).collect();
        let flags_json = serde_json::to_string(&flags)
            .map_err(|error| RepositoryError::Decode(format!("compliance flags: {error}")))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO conversation_session (
                id,
                tenant_id,
                contact_id,
                channel,
                state,
                created_at,
                last_activity_at,
                compliance_flags_json,
                ai_disclosure_sent,
                recording_notice_sent,
                opted_out,
                automated_messages_sent,
                needs_human_review,
                archived_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                channel = excluded.channel,
                state = excluded.state,
                last_activity_at = excluded.last_activity_at,
                compliance_flags_json = excluded.compliance_flags_json,
                ai_disclosure_sent = excluded.ai_disclosure_sent,
                recording_notice_sent = excluded.recording_notice_sent,
                opted_out = excluded.opted_out,
                automated_messages_sent = excluded.automated_messages_sent,
                needs_human_review = excluded.needs_human_review,
                archived_at = excluded.archived_at",
        )
        .bind(&session.id.0)
        .bind(&session.tenant_id.0)
        .bind(&session.contact_id.0)
        .bind(session.channel.as_str())
        .bind(session.state.as_str())
        .bind(format_timestamp(session.created_at))
        .bind(format_timestamp(session.last_activity_at))
        .bind(flags_json)
        .bind(session.compliance.ai_disclosure_sent)
        .bind(session.compliance.recording_notice_sent)
        .bind(session.compliance.opted_out)
        .bind(i64::from(session.automated_messages_sent))
        .bind(session.needs_human_review)
        .bind(session.archived_at.map(format_timestamp))
        .execute(&mut *tx)
        .await?;

        // History is append-only; rows already stored keep their outcome via `set_outcome`.
        let stored: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM handoff_event WHERE session_id = ?")
                .bind(&session.id.0)
                .fetch_one(&mut *tx)
                .await?;
        let already_stored = usize::try_from(stored)
            .map_err(|_| RepositoryError::Decode(format!("invalid handoff event count {stored}")))?;

        for (sequence, event) in session.handoff_history.iter().enumerate().skip(already_stored) {
            let sequence = i64::try_from(sequence)
                .map_err(|_| RepositoryError::Decode("handoff history too long".to_string()))?;
            sqlx::query(
                "INSERT INTO handoff_event (
                    id,
                    session_id,
                    tenant_id,
                    sequence,
                    from_state,
                    to_state,
                    confidence,
                    threshold_used,
                    rejected,
                    fallback,
                    outcome,
                    occurred_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&event.id.0)
            .bind(&event.session_id.0)
            .bind(&event.tenant_id.0)
            .bind(sequence)
            .bind(event.from_state.as_str())
            .bind(event.to_state.as_str())
            .bind(event.confidence)
            .bind(event.threshold_used)
            .bind(event.rejected)
            .bind(event.fallback)
            .bind(event.outcome.as_str())
            .bind(format_timestamp(event.occurred_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_inactive(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<SessionId>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id
             FROM conversation_session
             WHERE archived_at IS NULL
               AND last_activity_at < ?
             ORDER BY last_activity_at ASC, id ASC
             LIMIT ?",
        )
        .bind(format_timestamp(before))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<SessionId, RepositoryError> { Ok(SessionId(row.try_get("id")?)) })
            .collect()
    }
}

fn session_from_row(row: SqliteRow) -> Result<ConversationSession, RepositoryError> {
    let channel_raw = row.try_get::<String, _>("channel")?;
    let state_raw = row.try_get::<String, _>("state")?;
    let flags_raw = row.try_get::<String, _>("compliance_flags_json")?;

    let labels: Vec<String> = serde_json::from_str(&flags_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid compliance_flags_json `{flags_raw}` ({error})"))
    })?;
    let compliance_flags = labels
        .iter()
        .map(|label| parse_label("violation type", label, ViolationType::parse))
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(ConversationSession {
        id: SessionId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        contact_id: ContactId(row.try_get("contact_id")?),
        channel: parse_label("channel", &channel_raw, Channel::parse)?,
        state: parse_label("conversation state", &state_raw, ConversationState::parse)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        last_activity_at: parse_timestamp("last_activity_at", row.try_get("last_activity_at")?)?,
        handoff_history: Vec::new(),
        compliance_flags,
        compliance: ComplianceState {
            ai_disclosure_sent: row.try_get("ai_disclosure_sent")?,
            recording_notice_sent: row.try_get("recording_notice_sent")?,
            opted_out: row.try_get("opted_out")?,
        },
        automated_messages_sent: parse_u32(
            "automated_messages_sent",
            row.try_get("automated_messages_sent")?,
        )?,
        needs_human_review: row.try_get("needs_human_review")?,
        archived_at: parse_optional_timestamp("archived_at", row.try_get("archived_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use leadline_core::domain::bot::{Channel, ConversationState};
    use leadline_core::domain::compliance::ViolationType;
    use leadline_core::domain::handoff::{HandoffEvent, HandoffEventId, HandoffOutcome};
    use leadline_core::domain::session::{ContactId, ConversationSession, SessionId, TenantId};

    use super::SqlSessionRepository;
    use crate::repositories::test_support::{parse_ts, setup_pool};
    use crate::repositories::{
        HandoffEventRepository, SessionRepository, SqlHandoffEventRepository,
    };

    fn sample_session(id: &str, last_activity: &str) -> ConversationSession {
        let mut session = ConversationSession::new(
            SessionId(id.to_string()),
            TenantId("acme".to_string()),
            ContactId("C-1".to_string()),
            Channel::Sms,
            parse_ts("2026-03-01T09:00:00Z"),
        );
        session.last_activity_at = parse_ts(last_activity);
        session
    }

    fn push_event(session: &mut ConversationSession, id: &str, to: ConversationState, rejected: bool) {
        let from = session.state;
        let event = HandoffEvent::new(
            HandoffEventId(id.to_string()),
            session,
            from,
            to,
            0.82,
            0.70,
            rejected,
            parse_ts("2026-03-01T09:01:00Z"),
        );
        session.handoff_history.push(event);
        if !rejected {
            session.state = to;
        }
    }

    #[tokio::test]
    async fn session_round_trips_with_history_in_order() {
        let pool = setup_pool().await;
        let repo = SqlSessionRepository::new(pool.clone());

        let mut session = sample_session("S-100", "2026-03-01T09:05:00Z");
        push_event(&mut session, "H-1", ConversationState::Lead, false);
        push_event(&mut session, "H-2", ConversationState::Buyer, true);
        push_event(&mut session, "H-3", ConversationState::Seller, false);
        session.compliance_flags.insert(ViolationType::BotDisclosureMissing);
        session.compliance.ai_disclosure_sent = true;
        session.automated_messages_sent = 2;

        repo.save(session.clone()).await.expect("save session");
        let loaded = repo.find_by_id(&session.id).await.expect("find").expect("session exists");

        assert_eq!(loaded, session);
        let ids: Vec<&str> = loaded.handoff_history.iter().map(|event| event.id.0.as_str()).collect();
        assert_eq!(ids, vec!["H-1", "H-2", "H-3"]);

        assert!(repo
            .find_by_id(&SessionId("S-missing".to_string()))
            .await
            .expect("find missing")
            .is_none());

        pool.close().await;
    }

    #[tokio::test]
    async fn resaving_appends_events_without_reopening_decided_outcomes() {
        let pool = setup_pool().await;
        let sessions = SqlSessionRepository::new(pool.clone());
        let events = SqlHandoffEventRepository::new(pool.clone());

        let mut session = sample_session("S-200", "2026-03-01T09:05:00Z");
        push_event(&mut session, "H-10", ConversationState::Lead, false);
        sessions.save(session.clone()).await.expect("first save");

        assert!(events
            .set_outcome(&HandoffEventId("H-10".to_string()), HandoffOutcome::Success)
            .await
            .expect("set outcome"));

        push_event(&mut session, "H-11", ConversationState::Seller, false);
        sessions.save(session.clone()).await.expect("second save");

        let loaded = sessions.find_by_id(&session.id).await.expect("find").expect("exists");
        assert_eq!(loaded.handoff_history.len(), 2);
        assert_eq!(loaded.handoff_history[0].outcome, HandoffOutcome::Success);
        assert_eq!(loaded.handoff_history[1].outcome, HandoffOutcome::Pending);
        assert_eq!(loaded.state, ConversationState::Seller);

        pool.close().await;
    }

    #[tokio::test]
    async fn resaving_inserts_only_new_events() {
        let pool = setup_pool().await;
        let sessions = SqlSessionRepository::new(pool.clone());

        let mut session = sample_session("S-250", "2026-03-01T09:05:00Z");
        push_event(&mut session, "H-20", ConversationState::Lead, false);
        session.handoff_history[0].fallback = true;
        sessions.save(session.clone()).await.expect("first save");

        // A stale in-memory outcome is not written back by a save.
        session.handoff_history[0].outcome = HandoffOutcome::Success;
        push_event(&mut session, "H-21", ConversationState::Buyer, false);
        sessions.save(session.clone()).await.expect("second save");

        let loaded = sessions.find_by_id(&session.id).await.expect("find").expect("exists");
        let ids: Vec<&str> = loaded.handoff_history.iter().map(|event| event.id.0.as_str()).collect();
        assert_eq!(ids, vec!["H-20", "H-21"]);
        assert_eq!(loaded.handoff_history[0].outcome, HandoffOutcome::Pending);
        assert!(loaded.handoff_history[0].fallback);
        assert!(!loaded.handoff_history[1].fallback);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM handoff_event WHERE session_id = ?")
            .bind(&session.id.0)
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(rows, 2);

        pool.close().await;
    }

    #[tokio::test]
    async fn list_inactive_skips_recent_and_archived_sessions() {
        let pool = setup_pool().await;
        let repo = SqlSessionRepository::new(pool.clone());

        repo.save(sample_session("S-old", "2026-03-01T09:00:00Z")).await.expect("save old");
        repo.save(sample_session("S-new", "2026-03-09T09:00:00Z")).await.expect("save new");
        let mut archived = sample_session("S-archived", "2026-03-01T08:00:00Z");
        archived.archived_at = Some(parse_ts("2026-03-05T00:00:00Z"));
        repo.save(archived).await.expect("save archived");

        let inactive = repo
            .list_inactive(parse_ts("2026-03-08T00:00:00Z"), 100)
            .await
            .expect("list inactive");
        assert_eq!(inactive, vec![SessionId("S-old".to_string())]);

        pool.close().await;
    }
}
