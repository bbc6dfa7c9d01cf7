use sqlx::{sqlite::SqliteRow, Row};

use leadline_core::domain::compliance::{
    ComplianceAction, ComplianceViolation, Severity, ViolationId, ViolationType,
};
use leadline_core::domain::session::{SessionId, TenantId};

use super::{
    format_timestamp, parse_label, parse_timestamp, ComplianceViolationRepository,
    RepositoryError,
};
use crate::DbPool;

pub struct SqlComplianceViolationRepository {
    pool: DbPool,
}

impl SqlComplianceViolationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ComplianceViolationRepository for SqlComplianceViolationRepository {
    async fn save(&self, violation: ComplianceViolation) -> Result<(), RepositoryError> {
        // Violations are immutable; a retried write of the same record is a no-op.
        sqlx::query(
            "INSERT INTO compliance_violation (
                id,
                session_id,
                tenant_id,
                violation_type,
                severity,
                action,
                rule,
                evidence,
                remediation,
                occurred_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING",
        )
        .bind(&violation.id.0)
        .bind(&violation.session_id.0)
        .bind(&violation.tenant_id.0)
        .bind(violation.violation_type.as_str())
        .bind(violation.severity.as_str())
        .bind(violation.action.as_str())
        .bind(&violation.rule)
        .bind(&violation.evidence)
        .bind(violation.remediation.as_deref())
        .bind(format_timestamp(violation.occurred_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ComplianceViolation>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                session_id,
                tenant_id,
                violation_type,
                severity,
                action,
                rule,
                evidence,
                remediation,
                occurred_at
             FROM compliance_violation
             WHERE session_id = ?
             ORDER BY occurred_at ASC, rowid ASC",
        )
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(violation_from_row).collect()
    }
}

fn violation_from_row(row: SqliteRow) -> Result<ComplianceViolation, RepositoryError> {
    let type_raw = row.try_get::<String, _>("violation_type")?;
    let severity_raw = row.try_get::<String, _>("severity")?;
    let action_raw = row.try_get::<String, _>("action")?;

    Ok(ComplianceViolation {
        id: ViolationId(row.try_get("id")?),
        session_id: SessionId(row.try_get("session_id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        violation_type: parse_label("violation type", &type_raw, ViolationType::parse)?,
        severity: parse_label("severity", &severity_raw, Severity::parse)?,
        action: parse_label("compliance action", &action_raw, ComplianceAction::parse)?,
        rule: row.try_get("rule")?,
        evidence: row.try_get("evidence")?,
        remediation: row.try_get("remediation")?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}
