use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use sqlx::{FromRow, SqlitePool};
use time::{serde::iso8601, OffsetDateTime};

/// A query helper type for operating on [Task]s. Usually rented from a
/// [Db](super::Db).
pub struct Tasks<'a> {
    pool: &'a SqlitePool,
}

/// A record struct for orchestration tasks that agents hand each other.
/// The interesting column is `status`: a task only ever moves
/// queued -> claimed -> running -> done/failed, and the claim transition is
/// guarded so exactly one agent wins it.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Task {
    pub id: i64,
    pub payload: String,
    status: String, // private, use .status().
    pub assignee: Option<String>,
    /// Unix ms when the winning agent claimed it.
    pub claim_ts: Option<i64>,
    pub lease_expires_at: Option<i64>,
    #[serde(with = "iso8601")]
    pub created: OffsetDateTime,
}

impl Task {
    pub fn status(&self) -> TaskStatus {
        self.status.as_str().into()
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TaskStatus {
    Queued,
    Claimed,
    Running,
    Done,
    Failed,
    Invalid,
}

impl From<&str> for TaskStatus {
    fn from(value: &str) -> Self {
        match value {
            "queued" => Self::Queued,
            "claimed" => Self::Claimed,
            "running" => Self::Running,
            "done" => Self::Done,
            "failed" => Self::Failed,
            _ => Self::Invalid,
        }
    }
}

impl From<TaskStatus> for &'static str {
    fn from(value: TaskStatus) -> Self {
        match value {
            TaskStatus::Queued => "queued",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Invalid => "INVALID",
        }
    }
}

const TASK_COLUMNS: &str = "id, payload, status, assignee, claim_ts, lease_expires_at, created";

impl<'a> Tasks<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: i64) -> anyhow::Result<Option<Task>> {
        let q = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        Ok(sqlx::query_as::<_, Task>(&q)
            .bind(id)
            .fetch_optional(self.pool)
            .await?)
    }

    pub async fn list(&self, status: Option<&str>, limit: i64) -> anyhow::Result<Vec<Task>> {
        let q = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY id LIMIT ?2"
        );
        Ok(sqlx::query_as::<_, Task>(&q)
            .bind(status)
            .bind(limit)
            .fetch_all(self.pool)
            .await?)
    }
}

// Write side: runs on the coordinator's connection.
impl Tasks<'_> {
    pub async fn create(conn: &mut SqliteConnection, payload: &str) -> anyhow::Result<Task> {
        let q = format!(
            "INSERT INTO tasks (payload) VALUES (?1)
             RETURNING {TASK_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, Task>(&q)
            .bind(payload)
            .fetch_one(conn)
            .await?)
    }

    /// Try to claim a queued task. One conditional update: the predicate is
    /// the precondition, and getting a row back is the success signal. A
    /// None here isn't an error -- it means some other agent got there
    /// first (or the task doesn't exist), and the caller should report
    /// "not claimed".
    pub async fn claim(
        conn: &mut SqliteConnection,
        id: i64,
        agent_id: &str,
        now_ms: i64,
        lease_ttl_ms: i64,
    ) -> anyhow::Result<Option<Task>> {
        let q = format!(
            "UPDATE tasks
             SET status = 'claimed', assignee = ?1, claim_ts = ?2, lease_expires_at = ?3
             WHERE id = ?4 AND status = 'queued' AND (assignee IS NULL OR assignee = ?1)
             RETURNING {TASK_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, Task>(&q)
            .bind(agent_id)
            .bind(now_ms)
            .bind(now_ms + lease_ttl_ms)
            .bind(id)
            .fetch_optional(conn)
            .await?)
    }

    /// claimed -> running, by the claiming agent only.
    pub async fn start(
        conn: &mut SqliteConnection,
        id: i64,
        agent_id: &str,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE tasks SET status = 'running'
             WHERE id = ?1 AND status = 'claimed' AND assignee = ?2",
        )
        .bind(id)
        .bind(agent_id)
        .execute(conn)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// claimed/running -> done or failed, by the claiming agent only.
    pub async fn finish(
        conn: &mut SqliteConnection,
        id: i64,
        agent_id: &str,
        ok: bool,
    ) -> anyhow::Result<bool> {
        let terminal = if ok { "done" } else { "failed" };
        let res = sqlx::query(
            "UPDATE tasks SET status = ?1
             WHERE id = ?2 AND status IN ('claimed', 'running') AND assignee = ?3",
        )
        .bind(terminal)
        .bind(id)
        .bind(agent_id)
        .execute(conn)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}
