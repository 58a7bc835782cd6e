use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use sqlx::{FromRow, SqlitePool};
use time::{serde::iso8601, OffsetDateTime};

use crate::util::uuid_string;

/// A query helper type for ingested documents. Usually rented from a
/// [Db](super::Db). The ingestion pipeline proper (walkers, parsers,
/// chunkers) lives outside this crate; what it hands us is a title and a
/// body, and those land here as a classified write.
pub struct Documents<'a> {
    pool: &'a SqlitePool,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    pub agent_id: String,
    #[serde(with = "iso8601")]
    pub created: OffsetDateTime,
}

const DOCUMENT_COLUMNS: &str = "id, title, content, agent_id, created";

impl<'a> Documents<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<Document>> {
        let q = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1");
        Ok(sqlx::query_as::<_, Document>(&q)
            .bind(id)
            .fetch_optional(self.pool)
            .await?)
    }

    /// Substring search over document titles and bodies, newest first.
    pub async fn search(&self, query: &str, limit: i64) -> anyhow::Result<Vec<Document>> {
        let q = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents
             WHERE title LIKE '%' || ?1 || '%' OR content LIKE '%' || ?1 || '%'
             ORDER BY created DESC, rowid DESC LIMIT ?2"
        );
        Ok(sqlx::query_as::<_, Document>(&q)
            .bind(query)
            .bind(limit)
            .fetch_all(self.pool)
            .await?)
    }
}

// Write side: runs on the coordinator's connection.
impl Documents<'_> {
    pub async fn put(
        conn: &mut SqliteConnection,
        agent_id: &str,
        title: &str,
        content: &str,
    ) -> anyhow::Result<Document> {
        let q = format!(
            "INSERT INTO documents (id, title, content, agent_id)
             VALUES (?1, ?2, ?3, ?4)
             RETURNING {DOCUMENT_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, Document>(&q)
            .bind(uuid_string())
            .bind(title)
            .bind(content)
            .bind(agent_id)
            .fetch_one(conn)
            .await?)
    }
}
