use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;

/// Type alias for the PostgreSQL connection pool
pub type DbPool = PgPool;

/// Creates and configures a PostgreSQL connection pool
///
/// # Arguments
/// * `database_url` - PostgreSQL connection string
/// * `max_connections` - Upper bound on pooled connections
/// * `acquire_timeout` - Deadline for checking a connection out of the pool
///
/// # Returns
/// * `Result<DbPool>` - Configured connection pool or error
pub async fn create_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<DbPool, sqlx::Error> {
    tracing::debug!("Creating database connection pool");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await?;

    tracing::info!("Database connection pool created successfully");
    Ok(pool)
}

/// Whether an error is worth one more attempt
///
/// Covers dropped connections, pool exhaustion, and Postgres serialization
/// failures / deadlocks (SQLSTATE 40001 and 40P01).
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|code| code == "40001" || code == "40P01")
            .unwrap_or(false),
        _ => false,
    }
}

/// Run a persistence operation under a deadline, retrying once on transient failure
///
/// A timed-out attempt is reported as `PoolTimedOut` so it is itself treated
/// as transient. The operation must be safe to repeat (every write in this
/// crate is guarded by a version predicate or an idempotency key).
pub async fn bounded<T, F, Fut>(deadline: Duration, mut op: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    match attempt(deadline, &mut op).await {
        Err(err) if is_transient(&err) => {
            tracing::warn!("Transient database error, retrying once: {}", err);
            attempt(deadline, &mut op).await
        }
        other => other,
    }
}

async fn attempt<T, F, Fut>(deadline: Duration, op: &mut F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(deadline, op()).await {
        Ok(result) => result,
        Err(_) => Err(sqlx::Error::PoolTimedOut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn test_bounded_retries_once_on_transient() {
        let calls = AtomicU32::new(0);

        let result: Result<u32, sqlx::Error> = bounded(Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bounded_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);

        let result: Result<u32, sqlx::Error> = bounded(Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(matches!(result, Err(sqlx::Error::RowNotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), sqlx::Error> = bounded(Duration::from_millis(10), || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(sqlx::Error::PoolTimedOut)));
    }
}
