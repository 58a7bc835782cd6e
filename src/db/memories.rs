use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use sqlx::{Executor, FromRow, Sqlite, SqlitePool};
use time::{serde::iso8601, OffsetDateTime};

use crate::util::uuid_string;

/// A query helper type for operating on [Memory] records. Usually rented
/// from a [Db](super::Db). Read methods use the rented pool; write methods
/// are associated functions that take the coordinator's connection.
pub struct Memories<'a> {
    pool: &'a SqlitePool,
}

/// A record struct for agent memories. A memory is one value written into
/// a (slot, scope) by one agent; at most one of those is `live` per owner
/// at a time, and the old ones chain forward through `superseded_by`.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Memory {
    pub id: String,
    pub slot: String,
    pub scope: String,
    pub agent_id: String,
    pub content: String,
    status: String, // private, use .status().
    pub superseded_by: Option<String>,
    #[serde(with = "iso8601")]
    pub created: OffsetDateTime,
    /// Unix milliseconds; None means the memory never expires.
    pub expires_at: Option<i64>,
    // notably excluded: the embedding blob, which only the detectors read.
}

impl Memory {
    pub fn status(&self) -> MemoryStatus {
        self.status.as_str().into()
    }
}

/// Memory lifecycle states. `Live` is the only one you can leave; the rest
/// are terminal. These are stored in the database as text, but the
/// application code can have a little enum. as a treat.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum MemoryStatus {
    Live,
    Superseded,
    Retracted,
    /// TTL'd out by a prune pass.
    Pruned,
    Invalid,
}

impl From<&str> for MemoryStatus {
    fn from(value: &str) -> Self {
        match value {
            "live" => Self::Live,
            "superseded" => Self::Superseded,
            "retracted" => Self::Retracted,
            "pruned" => Self::Pruned,
            _ => Self::Invalid,
        }
    }
}

impl From<MemoryStatus> for &'static str {
    fn from(value: MemoryStatus) -> Self {
        match value {
            MemoryStatus::Live => "live",
            MemoryStatus::Superseded => "superseded",
            MemoryStatus::Retracted => "retracted",
            MemoryStatus::Pruned => "pruned",
            MemoryStatus::Invalid => "INVALID",
        }
    }
}

const MEMORY_COLUMNS: &str =
    "id, slot, scope, agent_id, content, status, superseded_by, created, expires_at";

// get, list, search -- the read side.
impl<'a> Memories<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// The newest live memory in a slot, from any agent. Writes from two
    /// agents to one slot both stay live (that's what the conflict
    /// detector is for), so "newest" is the view a reader gets.
    pub async fn get(&self, slot: &str, scope: &str) -> anyhow::Result<Option<Memory>> {
        let q = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE slot = ?1 AND scope = ?2 AND status = 'live'
             ORDER BY created DESC, rowid DESC LIMIT 1"
        );
        Ok(sqlx::query_as::<_, Memory>(&q)
            .bind(slot)
            .bind(scope)
            .fetch_optional(self.pool)
            .await?)
    }

    pub async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Memory>> {
        let q = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1");
        Ok(sqlx::query_as::<_, Memory>(&q)
            .bind(id)
            .fetch_optional(self.pool)
            .await?)
    }

    /// List live memories, optionally filtered by scope and/or owner,
    /// newest first.
    pub async fn list(
        &self,
        scope: Option<&str>,
        agent_id: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<Vec<Memory>> {
        let q = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE status = 'live'
               AND (?1 IS NULL OR scope = ?1)
               AND (?2 IS NULL OR agent_id = ?2)
             ORDER BY created DESC, rowid DESC LIMIT ?3"
        );
        Ok(sqlx::query_as::<_, Memory>(&q)
            .bind(scope)
            .bind(agent_id)
            .bind(limit)
            .fetch_all(self.pool)
            .await?)
    }

    /// Case-insensitive substring search over live memory content, newest
    /// first. The real search stack sits in front of this; the store-side
    /// fallback just has to be correct, not clever.
    pub async fn search(&self, query: &str, limit: i64) -> anyhow::Result<Vec<Memory>> {
        let q = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE status = 'live' AND content LIKE '%' || ?1 || '%' ESCAPE '\\'
             ORDER BY created DESC, rowid DESC LIMIT ?2"
        );
        Ok(sqlx::query_as::<_, Memory>(&q)
            .bind(like_escape(query))
            .bind(limit)
            .fetch_all(self.pool)
            .await?)
    }
}

// put, supersede, retract, prune, attach_embedding -- the write side.
// These take `&mut SqliteConnection` and run on the write coordinator (or
// the CLI's scoped connection, which holds the same lock file).
impl Memories<'_> {
    /// Write a memory into a slot. If the writing agent already had a live
    /// memory there, it gets superseded by the new one, all in the current
    /// transaction. Returns the new record plus the superseded id, if any.
    pub async fn put(
        conn: &mut SqliteConnection,
        agent_id: &str,
        slot: &str,
        scope: &str,
        content: &str,
        expires_at: Option<i64>,
    ) -> anyhow::Result<(Memory, Option<String>)> {
        // Retire our own previous live value first, so the one-live-per-
        // owner index has room for the insert.
        let old: Option<(String,)> = sqlx::query_as(
            "UPDATE memories SET status = 'superseded'
             WHERE slot = ?1 AND scope = ?2 AND agent_id = ?3 AND status = 'live'
             RETURNING id",
        )
        .bind(slot)
        .bind(scope)
        .bind(agent_id)
        .fetch_optional(&mut *conn)
        .await?;
        let old_id = old.map(|r| r.0);

        let new_id = uuid_string();
        let q = format!(
            "INSERT INTO memories (id, slot, scope, agent_id, content, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             RETURNING {MEMORY_COLUMNS}"
        );
        let memory = sqlx::query_as::<_, Memory>(&q)
            .bind(&new_id)
            .bind(slot)
            .bind(scope)
            .bind(agent_id)
            .bind(content)
            .bind(expires_at)
            .fetch_one(&mut *conn)
            .await?;

        if let Some(old_id) = &old_id {
            sqlx::query("UPDATE memories SET superseded_by = ?1 WHERE id = ?2")
                .bind(&new_id)
                .bind(old_id)
                .execute(&mut *conn)
                .await?;
        }
        Ok((memory, old_id))
    }

    /// Explicitly supersede a specific memory with new content from
    /// `agent_id`. The guard is on the target still being live; a miss
    /// (already superseded/retracted/missing) comes back as Ok(None).
    pub async fn supersede(
        conn: &mut SqliteConnection,
        agent_id: &str,
        target_id: &str,
        content: &str,
        expires_at: Option<i64>,
    ) -> anyhow::Result<Option<Memory>> {
        let target: Option<(String, String)> = sqlx::query_as(
            "UPDATE memories SET status = 'superseded'
             WHERE id = ?1 AND status = 'live'
             RETURNING slot, scope",
        )
        .bind(target_id)
        .fetch_optional(&mut *conn)
        .await?;
        let Some((slot, scope)) = target else {
            return Ok(None);
        };

        let (memory, _) =
            Self::put(&mut *conn, agent_id, &slot, &scope, content, expires_at).await?;
        sqlx::query("UPDATE memories SET superseded_by = ?1 WHERE id = ?2")
            .bind(&memory.id)
            .bind(target_id)
            .execute(&mut *conn)
            .await?;
        Ok(Some(memory))
    }

    /// Retract a live memory. False means the guard missed: it was already
    /// superseded, retracted, pruned, or never existed.
    pub async fn retract(conn: &mut SqliteConnection, id: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE memories SET status = 'retracted' WHERE id = ?1 AND status = 'live'",
        )
        .bind(id)
        .execute(conn)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// TTL prune: every live memory whose expiry is in the past goes to
    /// `pruned`. Naturally idempotent -- a second pass matches nothing.
    pub async fn prune(conn: &mut SqliteConnection, now_ms: i64) -> anyhow::Result<u64> {
        let res = sqlx::query(
            "UPDATE memories SET status = 'pruned'
             WHERE status = 'live' AND expires_at IS NOT NULL AND expires_at <= ?1",
        )
        .bind(now_ms)
        .execute(conn)
        .await?;
        Ok(res.rows_affected())
    }

    /// Store a computed embedding, but only if the memory is still live and
    /// still unembedded. The compute happened outside any transaction, so
    /// the guard is what makes the late write safe.
    pub async fn attach_embedding(
        conn: &mut SqliteConnection,
        id: &str,
        embedding: &[u8],
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE memories SET embedding = ?1
             WHERE id = ?2 AND status = 'live' AND embedding IS NULL",
        )
        .bind(embedding)
        .bind(id)
        .execute(conn)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

// Detector support, generic over executor because the detectors read both
// through the pool (cheap pre-checks) and on the writer (authoritative).
impl Memories<'_> {
    /// The live members of a slot: (memory id, owning agent).
    pub async fn live_in_slot<'e, E>(
        exec: E,
        slot: &str,
        scope: &str,
    ) -> Result<Vec<(String, String)>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as(
            "SELECT id, agent_id FROM memories
             WHERE slot = ?1 AND scope = ?2 AND status = 'live'
             ORDER BY rowid",
        )
        .bind(slot)
        .bind(scope)
        .fetch_all(exec)
        .await
    }

    /// One memory's embedding, if it has been computed.
    pub async fn embedding_of<'e, E>(exec: E, id: &str) -> Result<Option<Vec<u8>>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row: Option<(Option<Vec<u8>>,)> =
            sqlx::query_as("SELECT embedding FROM memories WHERE id = ?1")
                .bind(id)
                .fetch_optional(exec)
                .await?;
        Ok(row.and_then(|r| r.0))
    }

    /// Every live, embedded memory except the one named. Duplicate-scan
    /// fodder.
    pub async fn live_embedded_except<'e, E>(
        exec: E,
        id: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as(
            "SELECT id, embedding FROM memories
             WHERE status = 'live' AND embedding IS NOT NULL AND id != ?1",
        )
        .bind(id)
        .fetch_all(exec)
        .await
    }

    /// Slot and scope for a memory in any status. Detectors use this to
    /// find which slot to re-check after a mutation.
    pub async fn slot_of<'e, E>(
        exec: E,
        id: &str,
    ) -> Result<Option<(String, String)>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as("SELECT slot, scope FROM memories WHERE id = ?1")
            .bind(id)
            .fetch_optional(exec)
            .await
    }
}

/// Escape LIKE wildcards in user-supplied search text. `\` is the escape
/// character the search queries declare.
fn like_escape(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_escaping() {
        assert_eq!(like_escape("plain"), "plain");
        assert_eq!(like_escape("100%"), "100\\%");
        assert_eq!(like_escape("a_b"), "a\\_b");
        assert_eq!(like_escape("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn status_round_trips() {
        for s in ["live", "superseded", "retracted", "pruned"] {
            let status: MemoryStatus = s.into();
            let back: &'static str = status.into();
            assert_eq!(back, s);
        }
        assert_eq!(MemoryStatus::from("gibberish"), MemoryStatus::Invalid);
    }
}
