use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use leadline_core::audit::AuditEvent;
use leadline_core::domain::compliance::{ComplianceViolation, OptOutRecord};
use leadline_core::domain::handoff::{HandoffEvent, HandoffEventId, HandoffOutcome};
use leadline_core::domain::session::{ContactId, ConversationSession, SessionId, TenantId};
use leadline_core::domain::threshold::{ConfidenceThreshold, ThresholdKey};

pub mod audit;
pub mod compliance;
pub mod handoff;
pub mod memory;
pub mod opt_out;
pub mod session;
pub mod threshold;

pub use audit::SqlAuditEventRepository;
pub use compliance::SqlComplianceViolationRepository;
pub use handoff::SqlHandoffEventRepository;
pub use memory::{
    InMemoryAuditEventRepository, InMemoryComplianceViolationRepository,
    InMemoryOptOutRepository, InMemorySessionRepository, InMemoryThresholdRepository,
};
pub use opt_out::SqlOptOutRepository;
pub use session::SqlSessionRepository;
pub use threshold::SqlThresholdRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn find_by_id(&self, id: &SessionId)
        -> Result<Option<ConversationSession>, RepositoryError>;

    /// Upserts the session row and appends handoff events not yet stored. Stored events are
    /// immutable except for a pending outcome.
    async fn save(&self, session: ConversationSession) -> Result<(), RepositoryError>;

    /// Unarchived sessions whose last activity is strictly before `before`, oldest first.
    async fn list_inactive(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<SessionId>, RepositoryError>;
}

#[async_trait]
pub trait HandoffEventRepository: Send + Sync {
    async fn find_by_id(&self, id: &HandoffEventId)
        -> Result<Option<HandoffEvent>, RepositoryError>;

    /// Sets the outcome of a still-pending event. Returns `false` when the event is missing or
    /// already decided.
    async fn set_outcome(
        &self,
        id: &HandoffEventId,
        outcome: HandoffOutcome,
    ) -> Result<bool, RepositoryError>;

    async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<HandoffEvent>, RepositoryError>;
}

#[async_trait]
pub trait ThresholdRepository: Send + Sync {
    async fn find(&self, key: &ThresholdKey)
        -> Result<Option<ConfidenceThreshold>, RepositoryError>;

    /// Writes `threshold` only if the stored version still equals `expected_version`
    /// (`0` meaning no row yet). Returns `false` on a lost race.
    async fn compare_and_swap(
        &self,
        threshold: ConfidenceThreshold,
        expected_version: u64,
    ) -> Result<bool, RepositoryError>;

    async fn list_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<ConfidenceThreshold>, RepositoryError>;
}

#[async_trait]
pub trait ComplianceViolationRepository: Send + Sync {
    async fn save(&self, violation: ComplianceViolation) -> Result<(), RepositoryError>;

    async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ComplianceViolation>, RepositoryError>;
}

#[async_trait]
pub trait AuditEventRepository: Send + Sync {
    async fn save(&self, event: AuditEvent) -> Result<(), RepositoryError>;

    async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<AuditEvent>, RepositoryError>;
}

#[async_trait]
pub trait OptOutRepository: Send + Sync {
    /// Idempotent; the first recorded keyword and time are kept.
    async fn record(&self, record: OptOutRecord) -> Result<(), RepositoryError>;

    async fn find(
        &self,
        tenant_id: &TenantId,
        contact_id: &ContactId,
    ) -> Result<Option<OptOutRecord>, RepositoryError>;

    async fn is_opted_out(
        &self,
        tenant_id: &TenantId,
        contact_id: &ContactId,
    ) -> Result<bool, RepositoryError> {
        Ok(self.find(tenant_id, contact_id).await?.is_some())
    }
}

/// Fixed-width UTC form so stored timestamps compare correctly as text.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|value| parse_timestamp(column, value)).transpose()
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("`{column}` out of range: {value}")))
}

pub(crate) fn parse_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("`{column}` out of range: {value}")))
}

pub(crate) fn to_i64(column: &str, value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("`{column}` too large to store: {value}")))
}

pub(crate) fn parse_label<T>(
    column: &str,
    value: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<T, RepositoryError> {
    parse(value).ok_or_else(|| RepositoryError::Decode(format!("unknown {column} `{value}`")))
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Utc};

    use crate::{connect_with_settings, migrations, DbPool};

    pub async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    pub fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
