use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPool;
use sqlx::Postgres;
use tracing::warn;

use crate::config::PoolConfig;
use crate::error::DatabaseError;
use crate::job::{LockedJob, UNLOCK_JOB_SQL};
use crate::types::{Job, NewJob};

/// A client for one `jobs` table in PostgreSQL.
///
/// Cheap to clone; all clones share the same connection pool.
#[derive(Clone)]
pub struct Client {
    pool: PgPool,
}

impl Client {
    /// Initialize a client on an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Initialize a client by building a connection pool from `config`.
    pub async fn connect(config: &PoolConfig) -> Result<Self, DatabaseError> {
        let pool = config
            .connect()
            .await
            .map_err(|error| DatabaseError::PoolCreationError { error })?;

        Ok(Self { pool })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueue a job, returning the id the database assigned to it.
    /// Once this returns, the row is visible to any `lock_job` call on the
    /// job's queue.
    pub async fn enqueue(&self, job: NewJob) -> Result<i64, DatabaseError> {
        self.enqueue_in(job, &self.pool).await
    }

    /// Enqueue a job on a caller-supplied executor, typically an open
    /// transaction. Workers cannot see the job until the caller commits.
    pub async fn enqueue_in<'c, E>(&self, job: NewJob, executor: E) -> Result<i64, DatabaseError>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        let base_query = r#"
INSERT INTO jobs
    (queue, priority, run_at, type, args)
VALUES
    ($1, $2, COALESCE($3, now()), $4, $5)
RETURNING id
        "#;

        sqlx::query_scalar(base_query)
            .bind(&job.queue)
            .bind(job.priority)
            .bind(job.run_at)
            .bind(&job.job_type)
            .bind(&job.args)
            .fetch_one(executor)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })
    }

    /// Claim the next eligible job on `queue`, or return `None` when every
    /// candidate is either not yet due or locked by another session.
    ///
    /// The claim pins one pooled connection: the advisory lock taken on the
    /// job id is scoped to that connection's session, and the transaction
    /// opened here stays open until a terminal operation on the returned
    /// [`LockedJob`] closes it.
    pub async fn lock_job(&self, queue: &str) -> Result<Option<LockedJob>, DatabaseError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|error| DatabaseError::ConnectionError { error })?;

        if let Err(error) = sqlx::query("BEGIN").execute(&mut *conn).await {
            return Err(DatabaseError::TransactionError {
                command: "BEGIN".to_owned(),
                error,
            });
        }

        // Walk eligible candidates in (priority, run_at, id) order, trying a
        // non-blocking advisory lock on each until one sticks. Candidates
        // locked by other sessions are skipped, not waited on.
        let base_query = r#"
WITH RECURSIVE candidates AS (
    SELECT
        (j).id,
        (j).priority,
        (j).run_at,
        pg_try_advisory_lock((j).id) AS locked
    FROM (
        SELECT j
        FROM jobs AS j
        WHERE queue = $1
          AND run_at <= now()
        ORDER BY priority, run_at, id
        LIMIT 1
    ) AS t1
    UNION ALL (
        SELECT
            (j).id,
            (j).priority,
            (j).run_at,
            pg_try_advisory_lock((j).id) AS locked
        FROM (
            SELECT (
                SELECT j
                FROM jobs AS j
                WHERE queue = $1
                  AND run_at <= now()
                  AND (priority, run_at, id) > (candidates.priority, candidates.run_at, candidates.id)
                ORDER BY priority, run_at, id
                LIMIT 1
            ) AS j
            FROM candidates
            WHERE candidates.id IS NOT NULL
            LIMIT 1
        ) AS t1
    )
)
SELECT id
FROM candidates
WHERE locked
LIMIT 1
        "#;

        let recheck_query = r#"
SELECT id, queue, priority, run_at, type, args, error_count, last_error
FROM jobs
WHERE id = $1
        "#;

        loop {
            let candidate: Option<i64> = match sqlx::query_scalar(base_query)
                .bind(queue)
                .fetch_optional(&mut *conn)
                .await
            {
                Ok(candidate) => candidate,
                Err(error) => {
                    abandon_scan(conn, None).await;
                    return Err(DatabaseError::QueryError {
                        command: "SELECT".to_owned(),
                        error,
                    });
                }
            };

            let Some(id) = candidate else {
                abandon_scan(conn, None).await;
                return Ok(None);
            };

            // The scan's snapshot predates the lock: the chosen row may have
            // been deleted by a commit that raced us. Re-read it on this
            // transaction before handing out a claim.
            match sqlx::query_as::<_, Job>(recheck_query)
                .bind(id)
                .fetch_optional(&mut *conn)
                .await
            {
                Ok(Some(job)) => return Ok(Some(LockedJob::new(job, conn))),
                Ok(None) => {
                    // Lost the race; drop the lock and scan again on the
                    // same connection.
                    match sqlx::query_scalar::<_, bool>(UNLOCK_JOB_SQL)
                        .bind(id)
                        .fetch_one(&mut *conn)
                        .await
                    {
                        Ok(released) => {
                            if !released {
                                warn!(job_id = id, queue, "advisory lock was not held at rescan");
                            }
                        }
                        Err(error) => {
                            drop(conn.detach());
                            return Err(DatabaseError::QueryError {
                                command: "SELECT".to_owned(),
                                error,
                            });
                        }
                    }
                }
                Err(error) => {
                    abandon_scan(conn, Some(id)).await;
                    return Err(DatabaseError::QueryError {
                        command: "SELECT".to_owned(),
                        error,
                    });
                }
            }
        }
    }
}

/// Best-effort cleanup of a claim attempt that won't produce a handle: close
/// the scan transaction, drop any advisory lock taken, and return the
/// connection to the pool. Failures close the connection instead of pooling
/// a session with an open transaction or a held lock.
async fn abandon_scan(mut conn: PoolConnection<Postgres>, locked_id: Option<i64>) {
    if sqlx::query("ROLLBACK").execute(&mut *conn).await.is_err() {
        drop(conn.detach());
        return;
    }

    if let Some(id) = locked_id {
        if sqlx::query_scalar::<_, bool>(UNLOCK_JOB_SQL)
            .bind(id)
            .fetch_one(&mut *conn)
            .await
            .is_err()
        {
            drop(conn.detach());
        }
    }
}
