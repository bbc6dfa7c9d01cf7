use sqlx::Row;

use leadline_core::domain::compliance::OptOutRecord;
use leadline_core::domain::session::{ContactId, TenantId};

use super::{format_timestamp, parse_timestamp, OptOutRepository, RepositoryError};
use crate::DbPool;

pub struct SqlOptOutRepository {
    pool: DbPool,
}

impl SqlOptOutRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl OptOutRepository for SqlOptOutRepository {
    async fn record(&self, record: OptOutRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO contact_opt_out (tenant_id, contact_id, keyword, recorded_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(tenant_id, contact_id) DO NOTHING",
        )
        .bind(&record.tenant_id.0)
        .bind(&record.contact_id.0)
        .bind(&record.keyword)
        .bind(format_timestamp(record.recorded_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(
        &self,
        tenant_id: &TenantId,
        contact_id: &ContactId,
    ) -> Result<Option<OptOutRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT tenant_id, contact_id, keyword, recorded_at
             FROM contact_opt_out
             WHERE tenant_id = ? AND contact_id = ?",
        )
        .bind(&tenant_id.0)
        .bind(&contact_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(OptOutRecord {
            tenant_id: TenantId(row.try_get("tenant_id")?),
            contact_id: ContactId(row.try_get("contact_id")?),
            keyword: row.try_get("keyword")?,
            recorded_at: parse_timestamp("recorded_at", row.try_get("recorded_at")?)?,
        }))
    }
}
