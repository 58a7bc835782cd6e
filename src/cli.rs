//! Administrative commands that run without (or alongside) a server.
//!
//! The deal with CLI writes: there's no coordinator in this process, so
//! they serialize against a running server the other way -- by taking the
//! same `<db>.lock` file the server's coordinator brackets its
//! transactions with, around a short-lived transaction on a dedicated
//! connection. Server writes before and after interleave cleanly; neither
//! side ever sees a busy error from the other. (This is the mirror image
//! of the in-server background worker, which must NOT take the lock and
//! rides the coordinator instead.)

use std::time::Duration;

use anyhow::Context;
use sqlx::sqlite::SqliteConnection;
use sqlx::{Connection, Row};

use crate::config::HoardConfig;
use crate::db::locks::{LockError, ServerLock, SyncLock, WriteLock};
use crate::db::writer::WriteTask;
use crate::db::{self, migrations, Jobs, JobKind, Memories};
use crate::util::now_ms;

/// Agent id recorded on rows the CLI writes.
const CLI_AGENT: &str = "cli";

/// Scoped-acquisition helper for administrative writes: open a dedicated
/// writable connection, take the cross-process write lock, run the task in
/// one immediate transaction, commit (or roll back), release, close.
pub async fn with_exclusive_write<T>(
    config: &HoardConfig,
    task: WriteTask<T>,
) -> anyhow::Result<T> {
    let lock = WriteLock::new(
        config.write_lock_path(),
        Duration::from_millis(config.database.lock_timeout_ms),
    );
    let _guard = lock.acquire().await?;
    let mut conn = db::writer_connection(&config.db_file, config.database.busy_timeout_ms)
        .await
        .context("storage unavailable")?;

    sqlx::query("BEGIN IMMEDIATE").execute(&mut conn).await?;
    let task_result = task(&mut conn).await;
    let outcome = match task_result {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut conn).await?;
            Ok(value)
        }
        Err(e) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut conn).await;
            Err(e)
        }
    };
    conn.close().await?;
    outcome
}

pub async fn memory_put(
    config: &HoardConfig,
    slot: &str,
    content: &str,
    ttl_days: Option<i64>,
) -> anyhow::Result<()> {
    let days = ttl_days.unwrap_or(config.memory.default_ttl_days);
    anyhow::ensure!(days >= 0, "ttl days can't be negative");
    let expires_at = now_ms() + days * 24 * 60 * 60 * 1000;

    let (slot_owned, content_owned) = (slot.to_string(), content.to_string());
    let task: WriteTask<(String, Option<String>)> =
        Box::new(move |conn: &mut SqliteConnection| {
            Box::pin(async move {
                let (memory, superseded) = Memories::put(
                    conn,
                    CLI_AGENT,
                    &slot_owned,
                    "global",
                    &content_owned,
                    Some(expires_at),
                )
                .await?;
                Ok((memory.id, superseded))
            })
        });
    let (id, superseded) = with_exclusive_write(config, task).await?;
    println!("wrote memory {id} to slot {slot:?}");
    if let Some(old) = superseded {
        println!("(superseded {old})");
    }

    // Post-write jobs go in their own transaction, after the write landed.
    // A server's worker will pick them up; if none is running they just
    // wait in the queue.
    let hook_id = id;
    let hooks: WriteTask<()> = Box::new(move |conn: &mut SqliteConnection| {
        Box::pin(async move {
            for kind in [
                JobKind::EmbedMemory,
                JobKind::DetectDuplicates,
                JobKind::DetectConflicts,
            ] {
                Jobs::enqueue(conn, kind, &hook_id).await?;
            }
            Ok(())
        })
    });
    with_exclusive_write(config, hooks).await?;
    Ok(())
}

pub async fn memory_get(config: &HoardConfig, slot: &str) -> anyhow::Result<()> {
    let pool = db::reader_pool(&config.db_file, config.database.busy_timeout_ms, 1)
        .await
        .context("storage unavailable")?;
    let memories = Memories::new(&pool);
    match memories.get(slot, "global").await? {
        Some(memory) => {
            println!("{}", memory.content);
        }
        None => {
            println!("not found");
        }
    }
    pool.close().await;
    Ok(())
}

pub async fn memory_prune(config: &HoardConfig) -> anyhow::Result<()> {
    let task: WriteTask<u64> = Box::new(|conn: &mut SqliteConnection| {
        Box::pin(async move { Memories::prune(conn, now_ms()).await })
    });
    let pruned = with_exclusive_write(config, task).await?;
    println!("pruned {pruned} expired memories");
    Ok(())
}

/// Run pending migrations. The migrator manages its own transactions, so
/// this holds the write lock around a bare connection rather than going
/// through the transaction wrapper.
pub async fn migrate(config: &HoardConfig) -> anyhow::Result<()> {
    let lock = WriteLock::new(
        config.write_lock_path(),
        Duration::from_millis(config.database.lock_timeout_ms),
    );
    let _guard = lock.acquire().await?;
    let mut conn = db::writer_connection(&config.db_file, config.database.busy_timeout_ms)
        .await
        .context("storage unavailable")?;
    migrations::run(&mut conn).await?;
    conn.close().await?;
    println!("migrations are up to date.");
    Ok(())
}

pub async fn status(config: &HoardConfig) -> anyhow::Result<()> {
    let pool = db::reader_pool(&config.db_file, config.database.busy_timeout_ms, 1)
        .await
        .context("storage unavailable")?;
    println!("database: {}", config.db_file.display());
    println!("migrations:");
    for line in migrations::Migrations::new(&pool).info().await? {
        println!("  {line}");
    }
    match crate::db::WorkerLease::current(&pool).await? {
        Some((holder, expires_at)) => {
            let state = if expires_at > now_ms() { "live" } else { "lapsed" };
            println!("worker lease: {holder} ({state})");
        }
        None => println!("worker lease: never held"),
    }
    let pending = Jobs::new(&pool).pending_count().await?;
    println!("pending jobs: {pending}");
    pool.close().await;
    Ok(())
}

/// The connector-sync maintenance pipeline. Holds the exclusive-create
/// sync lock for the duration; a second concurrent `hoard sync` bails out
/// with a clear message instead of doubling up.
pub async fn sync(config: &HoardConfig) -> anyhow::Result<()> {
    let _lock = match SyncLock::acquire(&config.sync_lock_path()) {
        Ok(lock) => lock,
        Err(LockError::Held(path)) => {
            anyhow::bail!(
                "a sync is already running (lock file {} exists)",
                path.display()
            );
        }
        Err(e) => return Err(e.into()),
    };

    let retention_ms = config.worker.job_retention_hours * 60 * 60 * 1000;
    let task: WriteTask<(u64, u64)> = Box::new(move |conn: &mut SqliteConnection| {
        Box::pin(async move {
            let pruned = Memories::prune(conn, now_ms()).await?;
            let swept = Jobs::sweep_terminal(conn, now_ms() - retention_ms).await?;
            Ok((pruned, swept))
        })
    });
    let (pruned, swept) = with_exclusive_write(config, task).await?;
    println!("sync done: pruned {pruned} memories, swept {swept} old jobs");
    Ok(())
}

/// Health checks for the store and, importantly, the lock primitives --
/// advisory file locks can silently stop excluding anything on network
/// filesystems, and that's not a failure mode you want to discover from
/// corrupted data.
pub async fn doctor(config: &HoardConfig) -> anyhow::Result<()> {
    let mut problems = 0usize;

    // The store opens and is really in WAL mode.
    match db::writer_connection(&config.db_file, config.database.busy_timeout_ms).await {
        Ok(mut conn) => {
            let row = sqlx::query("PRAGMA journal_mode")
                .fetch_one(&mut conn)
                .await?;
            let mode: String = row.try_get(0)?;
            if mode.eq_ignore_ascii_case("wal") {
                println!("ok: store opens, journal_mode=wal");
            } else {
                println!("PROBLEM: journal_mode is {mode}, expected wal");
                problems += 1;
            }
            match migrations::Migrations::new(
                &db::reader_pool(&config.db_file, config.database.busy_timeout_ms, 1).await?,
            )
            .validate()
            .await
            {
                Ok(()) => println!("ok: migrations validate"),
                Err(e) => {
                    println!("PROBLEM: {e}");
                    problems += 1;
                }
            }
            conn.close().await?;
        }
        Err(e) => {
            println!("PROBLEM: can't open the store at {}: {e}", config.db_file.display());
            problems += 1;
        }
    }

    // The advisory lock primitive actually excludes a second descriptor.
    // If it doesn't, this filesystem (network mount?) can't protect the
    // store and every cross-process guarantee is off.
    let probe_path = config.db_file.with_extension("db.doctor");
    let probe_a = WriteLock::new(probe_path.clone(), Duration::from_millis(10));
    let probe_b = WriteLock::new(probe_path.clone(), Duration::from_millis(10));
    let held = probe_a.try_acquire()?;
    if held.is_some() && probe_b.try_acquire()?.is_none() {
        println!("ok: advisory file locks exclude on this filesystem");
    } else {
        println!(
            "PROBLEM: advisory locks don't exclude here; is {} on a network mount?",
            config.db_file.parent().unwrap_or(config.db_file.as_ref()).display()
        );
        problems += 1;
    }
    drop(held);
    let _ = std::fs::remove_file(&probe_path);

    // Who's around right now (informational).
    match ServerLock::acquire(&config.server_lock_path()) {
        Ok(lock) => {
            println!("ok: no server is running");
            drop(lock);
        }
        Err(LockError::Held(_)) => println!("note: a server is running on this store"),
        Err(e) => return Err(e.into()),
    }
    if config.sync_lock_path().exists() {
        println!(
            "note: sync lock file {} exists; a sync is running, or one crashed and left it behind",
            config.sync_lock_path().display()
        );
    }

    if problems == 0 {
        println!("all checks passed.");
        Ok(())
    } else {
        anyhow::bail!("{problems} problem(s) found");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    async fn put_via_writer(db: &crate::db::TestDb, slot: &str, content: &str) {
        let (slot, content) = (slot.to_string(), content.to_string());
        let task: WriteTask<()> = Box::new(move |conn: &mut SqliteConnection| {
            Box::pin(async move {
                Memories::put(conn, "server", &slot, "global", &content, None).await?;
                Ok(())
            })
        });
        db.writer.submit("server_put", task).await.unwrap();
    }

    #[tokio::test]
    async fn cli_writes_interleave_with_a_running_coordinator() {
        let db = Db::new_test_db().await;
        // Server-side write through the coordinator...
        put_via_writer(&db, "before", "server value").await;

        // ...then a CLI-style scoped write on its own connection, which
        // serializes against the coordinator purely through the lock file.
        let task: WriteTask<()> = Box::new(|conn: &mut SqliteConnection| {
            Box::pin(async move {
                Memories::put(conn, CLI_AGENT, "admin", "global", "cli value", None).await?;
                Ok(())
            })
        });
        with_exclusive_write(&db.config, task).await.unwrap();

        // ...and the server writes again after. Nobody saw a busy error,
        // and all three values landed.
        put_via_writer(&db, "after", "server value").await;
        for slot in ["before", "admin", "after"] {
            assert!(db.memories().get(slot, "global").await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn sync_holds_its_lock_and_does_maintenance() {
        let db = Db::new_test_db().await;
        // TTL'd-out memory for sync to prune.
        let task: WriteTask<()> = Box::new(|conn: &mut SqliteConnection| {
            Box::pin(async move {
                Memories::put(conn, "a", "old", "global", "stale", Some(0)).await?;
                Ok(())
            })
        });
        db.writer.submit("seed", task).await.unwrap();

        // A stuck sync blocks the pipeline with a clear message...
        let held = SyncLock::acquire(&db.config.sync_lock_path()).unwrap();
        let err = sync(&db.config).await.unwrap_err();
        assert!(err.to_string().contains("already running"));
        drop(held);

        // ...and a real run prunes and releases.
        sync(&db.config).await.unwrap();
        assert!(db.memories().get("old", "global").await.unwrap().is_none());
        assert!(!db.config.sync_lock_path().exists());
    }

    #[tokio::test]
    async fn doctor_passes_on_a_healthy_store() {
        let db = Db::new_test_db().await;
        doctor(&db.config).await.unwrap();
    }
}
