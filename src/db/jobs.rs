use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use sqlx::{FromRow, SqlitePool};
use time::{serde::iso8601, OffsetDateTime};

/// A query helper type for the background job queue and the worker lease.
/// Usually rented from a [Db](super::Db). The queue is just another table,
/// written under the same discipline as everything else; what makes it a
/// queue is the conditional claim update.
pub struct Jobs<'a> {
    pool: &'a SqlitePool,
}

/// A record struct for background jobs. Enqueued by post-write hooks after
/// the triggering write commits, drained by whichever worker holds the
/// lease.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Job {
    pub id: i64,
    kind: String, // private, use .kind().
    pub target_id: String,
    pub state: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    #[serde(with = "iso8601")]
    pub created: OffsetDateTime,
    pub finished_at: Option<i64>,
}

impl Job {
    pub fn kind(&self) -> JobKind {
        self.kind.as_str().into()
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum JobKind {
    /// Compute and attach an embedding to a memory.
    EmbedMemory,
    /// Scan for near-duplicates of a memory.
    DetectDuplicates,
    /// Re-check a memory's slot for cross-agent conflicts.
    DetectConflicts,
    Invalid,
}

impl From<&str> for JobKind {
    fn from(value: &str) -> Self {
        match value {
            "embed_memory" => Self::EmbedMemory,
            "detect_duplicates" => Self::DetectDuplicates,
            "detect_conflicts" => Self::DetectConflicts,
            _ => Self::Invalid,
        }
    }
}

impl From<JobKind> for &'static str {
    fn from(value: JobKind) -> Self {
        match value {
            JobKind::EmbedMemory => "embed_memory",
            JobKind::DetectDuplicates => "detect_duplicates",
            JobKind::DetectConflicts => "detect_conflicts",
            JobKind::Invalid => "INVALID",
        }
    }
}

/// How many attempts a job gets before it's marked failed for good.
pub const JOB_MAX_ATTEMPTS: i64 = 3;

const JOB_COLUMNS: &str =
    "id, kind, target_id, state, attempts, last_error, created, finished_at";

impl<'a> Jobs<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, state: Option<&str>, limit: i64) -> anyhow::Result<Vec<Job>> {
        let q = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (?1 IS NULL OR state = ?1)
             ORDER BY id LIMIT ?2"
        );
        Ok(sqlx::query_as::<_, Job>(&q)
            .bind(state)
            .bind(limit)
            .fetch_all(self.pool)
            .await?)
    }

    pub async fn pending_count(&self) -> anyhow::Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM jobs WHERE state = 'pending'")
            .fetch_one(self.pool)
            .await?;
        Ok(row.0)
    }
}

// Write side: runs on the coordinator's connection.
impl Jobs<'_> {
    pub async fn enqueue(
        conn: &mut SqliteConnection,
        kind: JobKind,
        target_id: &str,
    ) -> anyhow::Result<i64> {
        let kind_str: &str = kind.into();
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO jobs (kind, target_id) VALUES (?1, ?2) RETURNING id",
        )
        .bind(kind_str)
        .bind(target_id)
        .fetch_one(conn)
        .await?;
        Ok(row.0)
    }

    /// Claim the oldest pending job, if any. Single conditional update (the
    /// id comes from a subquery in the same statement), so it stays correct
    /// even if a future worker runs outside this process's coordinator.
    pub async fn claim_next(conn: &mut SqliteConnection) -> anyhow::Result<Option<Job>> {
        let q = format!(
            "UPDATE jobs SET state = 'in_flight', attempts = attempts + 1
             WHERE id = (SELECT id FROM jobs WHERE state = 'pending' ORDER BY id LIMIT 1)
               AND state = 'pending'
             RETURNING {JOB_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, Job>(&q).fetch_optional(conn).await?)
    }

    pub async fn mark_done(
        conn: &mut SqliteConnection,
        id: i64,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE jobs SET state = 'done', finished_at = ?1
             WHERE id = ?2 AND state = 'in_flight'",
        )
        .bind(now_ms)
        .bind(id)
        .execute(conn)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Record a failure. Jobs with attempts left go back to pending;
    /// exhausted ones go terminal with the error kept on the row.
    pub async fn mark_failed(
        conn: &mut SqliteConnection,
        id: i64,
        error: &str,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE jobs
             SET state = CASE WHEN attempts >= ?1 THEN 'failed' ELSE 'pending' END,
                 last_error = ?2,
                 finished_at = CASE WHEN attempts >= ?1 THEN ?3 ELSE NULL END
             WHERE id = ?4 AND state = 'in_flight'",
        )
        .bind(JOB_MAX_ATTEMPTS)
        .bind(error)
        .bind(now_ms)
        .bind(id)
        .execute(conn)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Delete terminal jobs that finished before the cutoff. Run by the
    /// worker's idle sweep and by `hoard sync`.
    pub async fn sweep_terminal(
        conn: &mut SqliteConnection,
        cutoff_ms: i64,
    ) -> anyhow::Result<u64> {
        let res = sqlx::query(
            "DELETE FROM jobs
             WHERE state IN ('done', 'failed')
               AND finished_at IS NOT NULL AND finished_at < ?1",
        )
        .bind(cutoff_ms)
        .execute(conn)
        .await?;
        Ok(res.rows_affected())
    }
}

/// The worker lease: a singleton row whose non-expired holder is the one
/// process allowed to drain the job queue.
pub struct WorkerLease;

impl WorkerLease {
    /// Acquire or renew in one guarded upsert. The WHERE clause on the
    /// upsert is the whole protocol: you get the row if it's yours already
    /// or if the current lease has lapsed. Zero affected rows means someone
    /// else holds a live lease -- do not steal, stop draining.
    pub async fn acquire_or_renew(
        conn: &mut SqliteConnection,
        holder: &str,
        ttl_ms: i64,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "INSERT INTO worker_lease (id, holder, expires_at) VALUES (1, ?1, ?2)
             ON CONFLICT (id) DO UPDATE
             SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE worker_lease.expires_at < ?3 OR worker_lease.holder = excluded.holder",
        )
        .bind(holder)
        .bind(now_ms + ttl_ms)
        .bind(now_ms)
        .execute(conn)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Who holds the lease right now, if anyone. Diagnostic only.
    pub async fn current(pool: &SqlitePool) -> anyhow::Result<Option<(String, i64)>> {
        Ok(
            sqlx::query_as("SELECT holder, expires_at FROM worker_lease WHERE id = 1")
                .fetch_optional(pool)
                .await?,
        )
    }
}
