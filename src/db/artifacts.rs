use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use sqlx::{FromRow, SqlitePool};
use time::{serde::iso8601, OffsetDateTime};

use crate::util::uuid_string;

/// A query helper type for named artifacts -- opaque blobs agents stash
/// under a unique name. Usually rented from a [Db](super::Db).
pub struct Artifacts<'a> {
    pool: &'a SqlitePool,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Artifact {
    pub id: String,
    pub name: String,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub agent_id: String,
    #[serde(with = "iso8601")]
    pub created: OffsetDateTime,
}

const ARTIFACT_COLUMNS: &str = "id, name, content, agent_id, created";

impl<'a> Artifacts<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, name: &str) -> anyhow::Result<Option<Artifact>> {
        let q = format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE name = ?1");
        Ok(sqlx::query_as::<_, Artifact>(&q)
            .bind(name)
            .fetch_optional(self.pool)
            .await?)
    }
}

// Write side: runs on the coordinator's connection.
impl Artifacts<'_> {
    /// Store an artifact under a name, replacing any previous content for
    /// that name. Last write wins; artifacts have no conflict semantics.
    pub async fn put(
        conn: &mut SqliteConnection,
        agent_id: &str,
        name: &str,
        content: &[u8],
    ) -> anyhow::Result<Artifact> {
        let q = format!(
            "INSERT INTO artifacts (id, name, content, agent_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (name) DO UPDATE
             SET content = excluded.content, agent_id = excluded.agent_id
             RETURNING {ARTIFACT_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, Artifact>(&q)
            .bind(uuid_string())
            .bind(name)
            .bind(content)
            .bind(agent_id)
            .fetch_one(conn)
            .await?)
    }
}
