use sqlx::{sqlite::SqliteRow, Row};

use leadline_core::domain::bot::{BotKind, ConversationState};
use leadline_core::domain::handoff::HandoffEdge;
use leadline_core::domain::session::TenantId;
use leadline_core::domain::threshold::{ConfidenceThreshold, ThresholdKey};

use super::{
    format_timestamp, parse_label, parse_timestamp, parse_u32, parse_u64, to_i64,
    RepositoryError, ThresholdRepository,
};
use crate::DbPool;

pub struct SqlThresholdRepository {
    pool: DbPool,
}

impl SqlThresholdRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ThresholdRepository for SqlThresholdRepository {
    async fn find(
        &self,
        key: &ThresholdKey,
    ) -> Result<Option<ConfidenceThreshold>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                tenant_id,
                from_state,
                to_bot,
                current_value,
                sample_count,
                success_count,
                window_samples,
                window_successes,
                version,
                last_updated_at
             FROM confidence_threshold
             WHERE tenant_id = ? AND from_state = ? AND to_bot = ?",
        )
        .bind(&key.tenant_id.0)
        .bind(key.edge.from.as_str())
        .bind(key.edge.to.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(threshold_from_row).transpose()
    }

    async fn compare_and_swap(
        &self,
        threshold: ConfidenceThreshold,
        expected_version: u64,
    ) -> Result<bool, RepositoryError> {
        let key = &threshold.key;
        let result = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO confidence_threshold (
                    tenant_id,
                    from_state,
                    to_bot,
                    current_value,
                    sample_count,
                    success_count,
                    window_samples,
                    window_successes,
                    version,
                    last_updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(tenant_id, from_state, to_bot) DO NOTHING",
            )
            .bind(&key.tenant_id.0)
            .bind(key.edge.from.as_str())
            .bind(key.edge.to.as_str())
            .bind(threshold.current_value)
            .bind(to_i64("sample_count", threshold.sample_count)?)
            .bind(to_i64("success_count", threshold.success_count)?)
            .bind(i64::from(threshold.window_samples))
            .bind(i64::from(threshold.window_successes))
            .bind(to_i64("version", threshold.version)?)
            .bind(format_timestamp(threshold.last_updated_at))
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE confidence_threshold
                 SET current_value = ?,
                     sample_count = ?,
                     success_count = ?,
                     window_samples = ?,
                     window_successes = ?,
                     version = ?,
                     last_updated_at = ?
                 WHERE tenant_id = ? AND from_state = ? AND to_bot = ? AND version = ?",
            )
            .bind(threshold.current_value)
            .bind(to_i64("sample_count", threshold.sample_count)?)
            .bind(to_i64("success_count", threshold.success_count)?)
            .bind(i64::from(threshold.window_samples))
            .bind(i64::from(threshold.window_successes))
            .bind(to_i64("version", threshold.version)?)
            .bind(format_timestamp(threshold.last_updated_at))
            .bind(&key.tenant_id.0)
            .bind(key.edge.from.as_str())
            .bind(key.edge.to.as_str())
            .bind(to_i64("version", expected_version)?)
            .execute(&self.pool)
            .await?
        };

        Ok(result.rows_affected() == 1)
    }

    async fn list_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<ConfidenceThreshold>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                tenant_id,
                from_state,
                to_bot,
                current_value,
                sample_count,
                success_count,
                window_samples,
                window_successes,
                version,
                last_updated_at
             FROM confidence_threshold
             WHERE tenant_id = ?
             ORDER BY from_state ASC, to_bot ASC",
        )
        .bind(&tenant_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(threshold_from_row).collect()
    }
}

fn threshold_from_row(row: SqliteRow) -> Result<ConfidenceThreshold, RepositoryError> {
    let from_raw = row.try_get::<String, _>("from_state")?;
    let to_raw = row.try_get::<String, _>("to_bot")?;
    let edge = HandoffEdge::new(
        parse_label("conversation state", &from_raw, ConversationState::parse)?,
        parse_label("bot", &to_raw, BotKind::parse)?,
    );

    Ok(ConfidenceThreshold {
        key: ThresholdKey::new(TenantId(row.try_get("tenant_id")?), edge),
        current_value: row.try_get("current_value")?,
        sample_count: parse_u64("sample_count", row.try_get("sample_count")?)?,
        success_count: parse_u64("success_count", row.try_get("success_count")?)?,
        window_samples: parse_u32("window_samples", row.try_get("window_samples")?)?,
        window_successes: parse_u32("window_successes", row.try_get("window_successes")?)?,
        version: parse_u64("version", row.try_get("version")?)?,
        last_updated_at: parse_timestamp("last_updated_at", row.try_get("last_updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use leadline_core::domain::bot::{BotKind, ConversationState};
    use leadline_core::domain::handoff::HandoffEdge;
    use leadline_core::domain::session::TenantId;
    use leadline_core::domain::threshold::{ConfidenceThreshold, ThresholdKey};

    use super::SqlThresholdRepository;
    use crate::repositories::test_support::{parse_ts, setup_pool};
    use crate::repositories::ThresholdRepository;

    fn key(from: ConversationState, to: BotKind) -> ThresholdKey {
        ThresholdKey::new(TenantId("acme".to_string()), HandoffEdge::new(from, to))
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_versions() {
        let pool = setup_pool().await;
        let repo = SqlThresholdRepository::new(pool.clone());
        let key = key(ConversationState::Seller, BotKind::Buyer);

        let cold = ConfidenceThreshold::cold_start(key.clone(), 0.70, parse_ts("2026-03-03T00:00:00Z"));
        assert!(repo.find(&key).await.expect("find").is_none());

        let mut first = cold.clone();
        first.sample_count = 1;
        first.success_count = 1;
        first.window_samples = 1;
        first.window_successes = 1;
        first.version = 1;
        assert!(repo.compare_and_swap(first.clone(), 0).await.expect("insert"));
        assert!(!repo.compare_and_swap(first.clone(), 0).await.expect("duplicate insert"));

        let mut second = first.clone();
        second.current_value = 0.65;
        second.version = 2;
        assert!(repo.compare_and_swap(second.clone(), 1).await.expect("update"));

        let mut stale = first.clone();
        stale.current_value = 0.80;
        stale.version = 2;
        assert!(!repo.compare_and_swap(stale, 1).await.expect("stale update"));

        assert_eq!(repo.find(&key).await.expect("find").expect("exists"), second);

        pool.close().await;
    }

    #[tokio::test]
    async fn list_for_tenant_is_scoped() {
        let pool = setup_pool().await;
        let repo = SqlThresholdRepository::new(pool.clone());
        let now = parse_ts("2026-03-03T00:00:00Z");

        for key in [
            key(ConversationState::Unassigned, BotKind::Lead),
            key(ConversationState::Lead, BotKind::Seller),
            ThresholdKey::new(
                TenantId("other".to_string()),
                HandoffEdge::new(ConversationState::Lead, BotKind::Seller),
            ),
        ] {
            let mut threshold = ConfidenceThreshold::cold_start(key, 0.70, now);
            threshold.version = 1;
            assert!(repo.compare_and_swap(threshold, 0).await.expect("insert"));
        }

        let acme = repo.list_for_tenant(&TenantId("acme".to_string())).await.expect("list");
        assert_eq!(acme.len(), 2);
        assert!(acme.iter().all(|threshold| threshold.key.tenant_id.0 == "acme"));

        pool.close().await;
    }
}
