use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use sqlx::{FromRow, SqlitePool};
use time::{serde::iso8601, OffsetDateTime};

/// A query helper type for semantic memory conflicts. Usually rented from
/// a [Db](super::Db). Conflict rows are advisory output from the detector;
/// nothing here merges or deletes memories.
pub struct Conflicts<'a> {
    pool: &'a SqlitePool,
}

/// A record struct for one detected conflict: several live memories in the
/// same (slot, scope) owned by different agents. Member ids are stored as
/// a JSON array; at single-tenant scale that beats a join table the
/// detector would have to diff on every pass.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Conflict {
    pub id: i64,
    pub slot: String,
    pub scope: String,
    member_ids: String, // JSON array, use .members().
    pub detector: String,
    pub status: String,
    #[serde(with = "iso8601")]
    pub created: OffsetDateTime,
    pub resolved_at: Option<i64>,
}

impl Conflict {
    pub fn members(&self) -> Vec<String> {
        serde_json::from_str(&self.member_ids).unwrap_or_default()
    }
}

const CONFLICT_COLUMNS: &str =
    "id, slot, scope, member_ids, detector, status, created, resolved_at";

impl<'a> Conflicts<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list_open(&self, limit: i64) -> anyhow::Result<Vec<Conflict>> {
        let q = format!(
            "SELECT {CONFLICT_COLUMNS} FROM memory_conflicts
             WHERE status = 'open' ORDER BY id LIMIT ?1"
        );
        Ok(sqlx::query_as::<_, Conflict>(&q)
            .bind(limit)
            .fetch_all(self.pool)
            .await?)
    }
}

// Write side: runs on the coordinator's connection.
impl Conflicts<'_> {
    /// Record (or refresh) the open conflict for a slot. The partial unique
    /// index on open (slot, scope) makes this an upsert: a re-run of the
    /// detector updates the member list in place instead of stacking rows.
    pub async fn record_open(
        conn: &mut SqliteConnection,
        slot: &str,
        scope: &str,
        member_ids: &[String],
        detector: &str,
    ) -> anyhow::Result<()> {
        let members_json = serde_json::to_string(member_ids)?;
        sqlx::query(
            "INSERT INTO memory_conflicts (slot, scope, member_ids, detector)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (slot, scope) WHERE status = 'open'
             DO UPDATE SET member_ids = excluded.member_ids, detector = excluded.detector",
        )
        .bind(slot)
        .bind(scope)
        .bind(&members_json)
        .bind(detector)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Close the open conflict for a slot whose live membership collapsed
    /// (memories left `live`, or only one agent remains). Detector-run-time
    /// cleanup, not a user action.
    pub async fn resolve_stale(
        conn: &mut SqliteConnection,
        slot: &str,
        scope: &str,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE memory_conflicts SET status = 'resolved', resolved_at = ?1
             WHERE slot = ?2 AND scope = ?3 AND status = 'open'",
        )
        .bind(now_ms)
        .bind(slot)
        .bind(scope)
        .execute(conn)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Explicit resolution by a human or agent. False: it wasn't open.
    pub async fn resolve(
        conn: &mut SqliteConnection,
        id: i64,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE memory_conflicts SET status = 'resolved', resolved_at = ?1
             WHERE id = ?2 AND status = 'open'",
        )
        .bind(now_ms)
        .bind(id)
        .execute(conn)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

/// A query helper type for near-duplicate pairs. Usually rented from a
/// [Db](super::Db).
pub struct Duplicates<'a> {
    pool: &'a SqlitePool,
}

/// A record struct for one detected near-duplicate pair. The pair is
/// stored ordered (memory_a < memory_b) so the unique index catches the
/// same pair found from either direction.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Duplicate {
    pub id: i64,
    pub memory_a: String,
    pub memory_b: String,
    pub score: f64,
    pub status: String,
    #[serde(with = "iso8601")]
    pub created: OffsetDateTime,
    pub resolved_at: Option<i64>,
}

const DUPLICATE_COLUMNS: &str =
    "id, memory_a, memory_b, score, status, created, resolved_at";

impl<'a> Duplicates<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list_open(&self, limit: i64) -> anyhow::Result<Vec<Duplicate>> {
        let q = format!(
            "SELECT {DUPLICATE_COLUMNS} FROM memory_duplicates
             WHERE status = 'open' ORDER BY id LIMIT ?1"
        );
        Ok(sqlx::query_as::<_, Duplicate>(&q)
            .bind(limit)
            .fetch_all(self.pool)
            .await?)
    }
}

// Write side: runs on the coordinator's connection.
impl Duplicates<'_> {
    /// Record a scored pair. Pairs are normalized to (low, high) id order
    /// before insert, and re-detections of a known pair are ignored.
    pub async fn record(
        conn: &mut SqliteConnection,
        first: &str,
        second: &str,
        score: f64,
    ) -> anyhow::Result<bool> {
        let (a, b) = if first <= second {
            (first, second)
        } else {
            (second, first)
        };
        let res = sqlx::query(
            "INSERT INTO memory_duplicates (memory_a, memory_b, score)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (memory_a, memory_b) DO NOTHING",
        )
        .bind(a)
        .bind(b)
        .bind(score)
        .execute(conn)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn resolve(
        conn: &mut SqliteConnection,
        id: i64,
        now_ms: i64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE memory_duplicates SET status = 'resolved', resolved_at = ?1
             WHERE id = ?2 AND status = 'open'",
        )
        .bind(now_ms)
        .bind(id)
        .execute(conn)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}
