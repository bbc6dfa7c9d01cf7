use std::future::Future;
use std::time::Duration;

use tracing::warn;

use leadline_core::config::PersistenceConfig;
use leadline_db::repositories::RepositoryError;

/// Retries a write with exponential backoff. Decode errors are not retried.
pub async fn retry_write<T, F, Fut>(
    config: &PersistenceConfig,
    operation: &'static str,
    mut write: F,
) -> Result<T, RepositoryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RepositoryError>>,
{
    let attempts = config.max_write_attempts.max(1);
    let mut backoff = Duration::from_millis(config.write_backoff_ms);
    let mut attempt = 1;
    loop {
        match write().await {
            Ok(value) => return Ok(value),
            Err(error @ RepositoryError::Decode(_)) => return Err(error),
            Err(error) if attempt >= attempts => return Err(error),
            Err(error) => {
                warn!(
                    event_name = "persistence.retry",
                    operation,
                    attempt,
                    error = %error,
                    "write failed; retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}
