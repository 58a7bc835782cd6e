use std::path::Path;
use std::time::Duration;

use sqlx::{
    pool::PoolOptions,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteSynchronous},
    ConnectOptions, SqlitePool,
};
use tokio_util::task::TaskTracker;
use tracing::debug;

use super::artifacts::Artifacts;
use super::conflicts::{Conflicts, Duplicates};
use super::documents::Documents;
use super::jobs::Jobs;
use super::memories::Memories;
use super::migrations::Migrations;
use super::tasks::Tasks;
use super::tokens::Tokens;
use super::writer::Writer;

/// The app's main database helper type. One of these goes in the app state,
/// and you can use it to access all the various resource methods, namespaced
/// for readability. Reads go straight to the pool; writes compose on the
/// coordinator's connection and get there via `db.writer`.
#[derive(Clone, Debug)]
pub struct Db {
    pub read_pool: SqlitePool,
    pub writer: Writer,
    // Query helpers may spawn SHORT-LIVED async tasks, so need a tracker but
    // not a cancel token.
    pub task_tracker: TaskTracker,
}

impl Db {
    pub fn new(read_pool: SqlitePool, writer: Writer, task_tracker: TaskTracker) -> Self {
        Self {
            read_pool,
            writer,
            task_tracker,
        }
    }

    pub fn memories(&self) -> Memories {
        Memories::new(&self.read_pool)
    }

    pub fn documents(&self) -> Documents {
        Documents::new(&self.read_pool)
    }

    pub fn artifacts(&self) -> Artifacts {
        Artifacts::new(&self.read_pool)
    }

    pub fn tasks(&self) -> Tasks {
        Tasks::new(&self.read_pool)
    }

    pub fn jobs(&self) -> Jobs {
        Jobs::new(&self.read_pool)
    }

    pub fn conflicts(&self) -> Conflicts {
        Conflicts::new(&self.read_pool)
    }

    pub fn duplicates(&self) -> Duplicates {
        Duplicates::new(&self.read_pool)
    }

    pub fn tokens(&self) -> Tokens {
        Tokens::new(&self.read_pool)
    }

    pub fn migrations(&self) -> Migrations {
        Migrations::new(&self.read_pool)
    }

    /// Stop the writer (draining whatever's queued) and close the read
    /// pool. Call after the task tracker has been waited out.
    pub async fn close(&self) {
        self.writer.shutdown();
        self.read_pool.close().await;
    }
}

/// Connection options shared by every handle on the store: WAL journaling,
/// NORMAL sync barrier (fsync at checkpoints, not every commit), the
/// configured busy-retry budget, and foreign keys on.
pub fn connect_options(db_file: impl AsRef<Path>, busy_timeout_ms: u64) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(db_file)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(busy_timeout_ms))
        .pragma("temp_store", "memory")
        .optimize_on_close(true, 400)
        .synchronous(SqliteSynchronous::Normal) // usually fine w/ wal
        .foreign_keys(true)
}

/// The many-connection reader side of the factory. Readers are handed out
/// per-request and see committed snapshots concurrent with the writer.
pub async fn reader_pool(
    db_file: impl AsRef<Path>,
    busy_timeout_ms: u64,
    max_connections: u32,
) -> Result<SqlitePool, sqlx::Error> {
    let pool_opts: PoolOptions<Sqlite> = PoolOptions::new()
        .max_connections(max_connections) // default's 10, but we'll be explicit.
        .min_connections(1)
        // boss makes a dollar, db thread makes a dime, that's why I fish crab on company time
        .max_lifetime(Duration::from_secs(60 * 60 * 4));
    pool_opts
        .connect_with(connect_options(db_file, busy_timeout_ms))
        .await
}

/// The single writable connection. Exactly one of these exists per process
/// and the write coordinator owns it.
pub async fn writer_connection(
    db_file: impl AsRef<Path>,
    busy_timeout_ms: u64,
) -> Result<SqliteConnection, sqlx::Error> {
    debug!("opening the writer connection");
    connect_options(db_file, busy_timeout_ms).connect().await
}

// Test stuff, kept a lil separate from the main stuff.
#[cfg(test)]
pub use test_support::TestDb;
