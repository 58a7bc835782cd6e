use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use sqlx::{FromRow, SqlitePool};
use time::{serde::iso8601, OffsetDateTime};

use crate::util::{sha256sum, uuid_string};

/// A query helper type for operating on [ApiToken]s. Usually rented from a
/// [Db](super::Db).
pub struct Tokens<'a> {
    pool: &'a SqlitePool,
}

/// Record struct for API authentication tokens. Tokens can't be chosen by
/// a user or re-used elsewhere, so they don't need a time-wasting hash
/// function like bcrypt or argon2. We still don't store the token
/// cleartext itself, but we just hash it with plain old unsalted sha256.
/// Sometimes the classics are best.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ApiToken {
    pub id: i64,
    scope: String, // private, use .scope().
    pub comment: Option<String>,
    #[serde(with = "iso8601")]
    pub created: OffsetDateTime,
    #[serde(with = "iso8601::option")]
    pub last_used: Option<OffsetDateTime>,
    pub revoked: bool,
    // notably excluded: token_hash and also the temporary cleartext.
}

impl ApiToken {
    pub fn scope(&self) -> TokenScope {
        self.scope.as_str().into()
    }
}

/// The exhaustive list of full permission types that API tokens can have.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TokenScope {
    /// Text: `read`. Can call read tools only.
    Read,
    /// Text: `write`. Can call anything.
    Write,
    /// Can't do shit!!
    Invalid,
}

impl From<&str> for TokenScope {
    fn from(value: &str) -> Self {
        match value {
            "read" => Self::Read,
            "write" => Self::Write,
            _ => Self::Invalid,
        }
    }
}

impl From<TokenScope> for &'static str {
    fn from(value: TokenScope) -> Self {
        match value {
            TokenScope::Read => "read",
            TokenScope::Write => "write",
            TokenScope::Invalid => "INVALID",
        }
    }
}

const TOKEN_COLUMNS: &str = "id, scope, comment, created, last_used, revoked";

// create, authenticate, revoke, list
impl<'a> Tokens<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, limit: i64) -> anyhow::Result<Vec<ApiToken>> {
        let q = format!(
            "SELECT {TOKEN_COLUMNS} FROM api_tokens
             WHERE revoked = 0 ORDER BY id LIMIT ?1"
        );
        Ok(sqlx::query_as::<_, ApiToken>(&q)
            .bind(limit)
            .fetch_all(self.pool)
            .await?)
    }

    /// Use the provided token cleartext to look up a token. Returns
    /// Ok(None) if the token doesn't match anything live.
    pub async fn authenticate(&self, cleartext: &str) -> anyhow::Result<Option<ApiToken>> {
        let token_hash = sha256sum(cleartext);
        let q = format!(
            "SELECT {TOKEN_COLUMNS} FROM api_tokens
             WHERE token_hash = ?1 AND revoked = 0"
        );
        Ok(sqlx::query_as::<_, ApiToken>(&q)
            .bind(token_hash)
            .fetch_optional(self.pool)
            .await?)
    }
}

// Write side: runs on the coordinator's connection.
impl Tokens<'_> {
    /// Create a token, and return it along with the *actual token
    /// cleartext.* This is the only time the cleartext is ever available.
    pub async fn create(
        conn: &mut SqliteConnection,
        scope: TokenScope,
        comment: Option<&str>,
    ) -> anyhow::Result<(ApiToken, String)> {
        let cleartext = format!("hoardv1.{}", uuid_string());
        let token_hash = sha256sum(&cleartext);
        let scope_str: &str = scope.into();
        let q = format!(
            "INSERT INTO api_tokens (token_hash, scope, comment)
             VALUES (?1, ?2, ?3)
             RETURNING {TOKEN_COLUMNS}"
        );
        let token = sqlx::query_as::<_, ApiToken>(&q)
            .bind(token_hash)
            .bind(scope_str)
            .bind(comment)
            .fetch_one(conn)
            .await?;
        Ok((token, cleartext))
    }

    /// Revoke by id. False: unknown id or already revoked.
    pub async fn revoke(conn: &mut SqliteConnection, id: i64) -> anyhow::Result<bool> {
        let res = sqlx::query("UPDATE api_tokens SET revoked = 1 WHERE id = ?1 AND revoked = 0")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(res.rows_affected() == 1)
    }
}
