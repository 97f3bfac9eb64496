use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, Postgres};
use tracing::warn;

use crate::error::DatabaseError;
use crate::retry::RetryPolicy;
use crate::types::Job;

pub(crate) const UNLOCK_JOB_SQL: &str = "SELECT pg_advisory_unlock($1)";

/// A claimed job.
///
/// Owns the pooled connection carrying both the claim's open transaction and
/// the session advisory lock on the job id. Exactly one of
/// [`delete`](LockedJob::delete), [`error`](LockedJob::error), or
/// [`release`](LockedJob::release) settles the claim; afterwards the handle
/// is inert and any further terminal call is a no-op returning success.
pub struct LockedJob {
    /// The row as it looked when the claim was taken.
    pub job: Job,
    conn: Option<PoolConnection<Postgres>>,
}

impl LockedJob {
    pub(crate) fn new(job: Job, conn: PoolConnection<Postgres>) -> Self {
        Self {
            job,
            conn: Some(conn),
        }
    }

    /// Whether a terminal operation has already settled this claim.
    pub fn is_settled(&self) -> bool {
        self.conn.is_none()
    }

    /// The connection carrying the claim's open transaction, while the claim
    /// is unsettled. Statements executed on it commit or roll back together
    /// with the job's own terminal operation.
    pub fn connection(&mut self) -> Option<&mut PgConnection> {
        self.conn.as_deref_mut()
    }

    /// Delete the job's row and commit the claim, releasing the advisory
    /// lock. On a query error the claim is rolled back instead and the error
    /// surfaced; the handle is inert either way.
    pub async fn delete(&mut self) -> Result<(), DatabaseError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let base_query = r#"
DELETE FROM jobs
WHERE id = $1
        "#;

        if let Err(error) = sqlx::query(base_query)
            .bind(self.job.id)
            .execute(&mut *conn)
            .await
        {
            abort_transaction(conn, self.job.id).await;
            return Err(DatabaseError::QueryError {
                command: "DELETE".to_owned(),
                error,
            });
        }

        close_transaction(conn, "COMMIT", self.job.id).await
    }

    /// Record a failed attempt and commit the claim, releasing the advisory
    /// lock. The row is kept: `error_count` is incremented, `last_error` set
    /// to `msg`, and `run_at` pushed into the future by the default
    /// [`RetryPolicy`] backoff.
    pub async fn error(&mut self, msg: &str) -> Result<(), DatabaseError> {
        self.error_with(msg, &RetryPolicy::default()).await
    }

    /// Same as [`error`](LockedJob::error), with the backoff taken from a
    /// caller-supplied policy.
    pub async fn error_with(
        &mut self,
        msg: &str,
        retry_policy: &RetryPolicy,
    ) -> Result<(), DatabaseError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        // The row's own counter is incremented in SQL; the snapshot plus one
        // matches it as long as this session holds the advisory lock.
        let interval = retry_policy.retry_interval(self.job.error_count.saturating_add(1));

        let base_query = r#"
UPDATE jobs
SET
    error_count = error_count + 1,
    run_at = now() + $1::interval,
    last_error = $2
WHERE
    id = $3
        "#;

        if let Err(error) = sqlx::query(base_query)
            .bind(interval)
            .bind(msg)
            .bind(self.job.id)
            .execute(&mut *conn)
            .await
        {
            abort_transaction(conn, self.job.id).await;
            return Err(DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            });
        }

        close_transaction(conn, "COMMIT", self.job.id).await
    }

    /// Relinquish the claim without touching the row: roll back the claim's
    /// transaction and release the advisory lock. The job becomes eligible
    /// for other workers again immediately.
    pub async fn release(&mut self) -> Result<(), DatabaseError> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };

        close_transaction(conn, "ROLLBACK", self.job.id).await
    }
}

/// Close the claim's transaction with `command` (COMMIT or ROLLBACK), then
/// release the advisory lock and hand the connection back to the pool.
/// The unlock must run after the transaction closes: unlocking first would
/// let a concurrent scan claim the id and recheck a row whose deletion has
/// not committed yet.
async fn close_transaction(
    mut conn: PoolConnection<Postgres>,
    command: &'static str,
    job_id: i64,
) -> Result<(), DatabaseError> {
    if let Err(error) = sqlx::query(command).execute(&mut *conn).await {
        // The session may still hold both the transaction and the lock;
        // close it rather than hand it back to the pool in that state.
        drop(conn.detach());
        return Err(DatabaseError::TransactionError {
            command: command.to_owned(),
            error,
        });
    }

    unlock_and_return(conn, job_id).await;
    Ok(())
}

/// Best-effort cleanup after a failed terminal statement: roll back and
/// unlock, closing the connection outright if either step fails.
async fn abort_transaction(mut conn: PoolConnection<Postgres>, job_id: i64) {
    if sqlx::query("ROLLBACK").execute(&mut *conn).await.is_err() {
        drop(conn.detach());
        return;
    }

    unlock_and_return(conn, job_id).await;
}

/// Release the advisory lock for `job_id` and return the connection to the
/// pool. Advisory locks are session-scoped, so a connection whose unlock
/// failed is closed instead of being pooled while still holding the lock.
async fn unlock_and_return(mut conn: PoolConnection<Postgres>, job_id: i64) {
    match sqlx::query_scalar::<_, bool>(UNLOCK_JOB_SQL)
        .bind(job_id)
        .fetch_one(&mut *conn)
        .await
    {
        Ok(true) => {}
        Ok(false) => warn!(job_id, "advisory lock was not held at unlock"),
        Err(error) => {
            warn!(
                job_id,
                %error,
                "failed to release advisory lock, closing connection"
            );
            drop(conn.detach());
        }
    }
}
