//! The write coordinator: one queue, one task, one writable connection.
//!
//! Every write in the process funnels through here. Submitters enqueue a
//! closure and block on a oneshot until the worker has run it; the worker
//! drains the queue strictly FIFO, and for each task it (1) takes the
//! cross-process write lock, (2) opens an immediate transaction, (3) runs
//! the closure against the one writable connection, (4) commits on success
//! or rolls back on failure, (5) releases the lock, (6) replies. A task
//! that fails -- including failing to get the lock -- reports its error to
//! the submitter and the worker moves on to the next item; one doomed task
//! never halts the queue.
//!
//! Re-entrancy: write helpers take `&mut SqliteConnection`, so code that is
//! already running on the writer composes further writes by plain function
//! call, on the already-open transaction. Calling [`Writer::submit`] from
//! the writer task itself can therefore only be a bug (the queue is busy
//! running you), and it fails fast with [`WriteError::ReentrantSubmit`]
//! rather than deadlocking.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;

use sqlx::sqlite::SqliteConnection;
use sqlx::Connection;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::locks::{LockError, WriteLock};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A queued write closure. Annotate the connection parameter when building
/// one inline (`Box::new(move |conn: &mut SqliteConnection| ...)`) so the
/// closure generalizes over the connection's lifetime.
pub type WriteTask<T> =
    Box<dyn for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, anyhow::Result<T>> + Send>;

type ErasedResult = Box<dyn Any + Send>;

tokio::task_local! {
    /// Present exactly while the worker is running a submitted task.
    static IN_WRITER: ();
}

#[derive(Error, Debug)]
pub enum WriteError {
    /// The cross-process write lock stayed contended past the configured
    /// timeout. Retryable; the worker itself is fine.
    #[error("couldn't acquire the database write lock within {waited_ms} ms")]
    LockUnavailable { waited_ms: u64 },

    #[error("write coordinator is shutting down")]
    Shutdown,

    /// `submit` was called from the writer task itself. Compose on the open
    /// transaction instead (write helpers take `&mut SqliteConnection`).
    #[error("re-entrant submit from the writer task")]
    ReentrantSubmit,

    #[error(transparent)]
    Lock(LockError),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    /// The submitted closure failed. Its transaction was rolled back.
    #[error(transparent)]
    Task(#[from] anyhow::Error),
}

impl WriteError {
    /// Whether a caller holding its own retry budget should bother
    /// resubmitting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WriteError::LockUnavailable { .. })
    }
}

struct Submission {
    label: String,
    task: WriteTask<ErasedResult>,
    reply: oneshot::Sender<Result<ErasedResult, WriteError>>,
}

enum QueueItem {
    Task(Submission),
    /// Poison pill: everything enqueued before it still runs, then the
    /// worker stops.
    Shutdown,
}

/// Cloneable handle to the write coordinator. The worker task and the
/// writable connection live behind the channel.
#[derive(Clone, Debug)]
pub struct Writer {
    queue: mpsc::UnboundedSender<QueueItem>,
}

impl Writer {
    /// Spawn the worker task (on the provided tracker, so shutdown can wait
    /// for the in-flight write) and hand back the submission handle. Takes
    /// ownership of the process's one writable connection.
    pub fn spawn(conn: SqliteConnection, lock: WriteLock, tracker: &TaskTracker) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tracker.spawn(writer_loop(conn, lock, rx));
        Self { queue: tx }
    }

    /// Run a write closure on the writer, blocking until it has committed
    /// (or failed). Returns whatever the closure returned.
    pub async fn submit<T>(&self, label: &str, task: WriteTask<T>) -> Result<T, WriteError>
    where
        T: Send + 'static,
    {
        if IN_WRITER.try_with(|_| ()).is_ok() {
            return Err(WriteError::ReentrantSubmit);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let erased: WriteTask<ErasedResult> = Box::new(move |conn: &mut SqliteConnection| {
            Box::pin(async move {
                let value = task(conn).await?;
                Ok(Box::new(value) as ErasedResult)
            })
        });
        let submission = Submission {
            label: label.to_string(),
            task: erased,
            reply: reply_tx,
        };
        self.queue
            .send(QueueItem::Task(submission))
            .map_err(|_| WriteError::Shutdown)?;
        // Once the enqueue lands, the task WILL run; if we get cancelled
        // here the work still happens and the result is discarded.
        let boxed = reply_rx.await.map_err(|_| WriteError::Shutdown)??;
        Ok(*boxed
            .downcast::<T>()
            .expect("write task result type mismatch"))
    }

    /// Enqueue the poison pill. Tasks already in the queue run first; the
    /// worker then closes the connection and exits. Idempotent enough --
    /// later submissions just get [`WriteError::Shutdown`].
    pub fn shutdown(&self) {
        let _ = self.queue.send(QueueItem::Shutdown);
    }
}

async fn writer_loop(
    mut conn: SqliteConnection,
    lock: WriteLock,
    mut rx: mpsc::UnboundedReceiver<QueueItem>,
) {
    info!("write coordinator started");
    while let Some(item) = rx.recv().await {
        let sub = match item {
            QueueItem::Shutdown => break,
            QueueItem::Task(sub) => sub,
        };
        let outcome = run_one(&mut conn, &lock, &sub.label, sub.task).await;
        if let Err(e) = &outcome {
            debug!(task = %sub.label, "write task failed: {e}");
        }
        if sub.reply.send(outcome).is_err() {
            debug!(task = %sub.label, "submitter went away before its result arrived");
        }
    }
    info!("write coordinator stopping");
    if let Err(e) = conn.close().await {
        warn!("error closing the writer connection: {e}");
    }
}

/// One full task lifecycle: lock, transact, run, settle, unlock.
async fn run_one(
    conn: &mut SqliteConnection,
    lock: &WriteLock,
    label: &str,
    task: WriteTask<ErasedResult>,
) -> Result<ErasedResult, WriteError> {
    let _guard = match lock.acquire().await {
        Ok(guard) => guard,
        Err(LockError::Timeout { waited_ms, .. }) => {
            return Err(WriteError::LockUnavailable { waited_ms });
        }
        Err(other) => return Err(WriteError::Lock(other)),
    };

    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    let task_result = IN_WRITER.scope((), task(&mut *conn)).await;
    match task_result {
        Ok(value) => match sqlx::query("COMMIT").execute(&mut *conn).await {
            Ok(_) => Ok(value),
            Err(commit_err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(commit_err.into())
            }
        },
        Err(task_err) => {
            if let Err(rb) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                warn!(task = %label, "rollback after failure also failed: {rb}");
            }
            Err(WriteError::Task(task_err))
        }
    }
    // _guard drops here: lock released after commit/rollback, before reply.
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::ConnectOptions;
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Barrier;

    struct Rig {
        writer: Writer,
        tracker: TaskTracker,
        lock_path: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    async fn test_writer(lock_timeout: Duration) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("scratch.db");
        let lock_path = dir.path().join("scratch.db.lock");
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
            .unwrap()
            .create_if_missing(true);
        let mut conn = opts.connect().await.unwrap();
        sqlx::query("CREATE TABLE log (seq INTEGER PRIMARY KEY, tag TEXT NOT NULL)")
            .execute(&mut conn)
            .await
            .unwrap();
        let tracker = TaskTracker::new();
        let writer = Writer::spawn(conn, WriteLock::new(lock_path.clone(), lock_timeout), &tracker);
        Rig {
            writer,
            tracker,
            lock_path,
            _dir: dir,
        }
    }

    fn append(tag: &'static str) -> WriteTask<()> {
        Box::new(move |conn: &mut SqliteConnection| {
            Box::pin(async move {
                sqlx::query("INSERT INTO log (tag) VALUES (?1)")
                    .bind(tag)
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
    }

    fn read_tags() -> WriteTask<Vec<String>> {
        Box::new(|conn: &mut SqliteConnection| {
            Box::pin(async move {
                let rows: Vec<(String,)> =
                    sqlx::query_as("SELECT tag FROM log ORDER BY seq").fetch_all(conn).await?;
                Ok(rows.into_iter().map(|r| r.0).collect())
            })
        })
    }

    #[tokio::test]
    async fn submissions_run_in_enqueue_order() {
        let rig = test_writer(Duration::from_secs(2)).await;
        // join! polls in argument order, so the enqueues happen in order
        // even though the futures run concurrently.
        let (a, b, c) = tokio::join!(
            rig.writer.submit("a", append("a")),
            rig.writer.submit("b", append("b")),
            rig.writer.submit("c", append("c")),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();
        let tags = rig.writer.submit("read", read_tags()).await.unwrap();
        assert_eq!(tags, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn failed_task_rolls_back_wholly() {
        let rig = test_writer(Duration::from_secs(2)).await;
        // Insert, then fail: the insert must not survive.
        let doomed: WriteTask<()> = Box::new(|conn: &mut SqliteConnection| {
            Box::pin(async move {
                sqlx::query("INSERT INTO log (tag) VALUES ('phantom')")
                    .execute(conn)
                    .await?;
                anyhow::bail!("nope");
            })
        });
        let err = rig.writer.submit("doomed", doomed).await.unwrap_err();
        assert!(matches!(err, WriteError::Task(_)));

        // The worker is still healthy and the phantom row is gone.
        let tags = rig.writer.submit("read", read_tags()).await.unwrap();
        assert!(tags.is_empty());
    }

    #[tokio::test]
    async fn lock_timeout_dooms_the_task_but_not_the_worker() {
        let rig = test_writer(Duration::from_millis(120)).await;
        // Steal the write lock out from under the coordinator.
        let thief = WriteLock::new(rig.lock_path.clone(), Duration::from_millis(10));
        let held = thief.try_acquire().unwrap().unwrap();

        let err = rig.writer.submit("starved", append("starved")).await.unwrap_err();
        assert!(matches!(err, WriteError::LockUnavailable { .. }));
        assert!(err.is_retryable());

        drop(held);
        rig.writer.submit("after", append("after")).await.unwrap();
        let tags = rig.writer.submit("read", read_tags()).await.unwrap();
        assert_eq!(tags, vec!["after"]);
    }

    #[tokio::test]
    async fn reentrant_submit_fails_fast_instead_of_deadlocking() {
        let rig = test_writer(Duration::from_secs(2)).await;
        let writer = rig.writer.clone();
        let task: WriteTask<()> = Box::new(move |conn: &mut SqliteConnection| {
            Box::pin(async move {
                // Inline composition is the supported path...
                sqlx::query("INSERT INTO log (tag) VALUES ('inline')")
                    .execute(&mut *conn)
                    .await?;
                // ...and a queue submit from in here must error, not hang.
                let nested = writer.submit("nested", append("nested")).await;
                assert!(matches!(nested, Err(WriteError::ReentrantSubmit)));
                Ok(())
            })
        });
        rig.writer.submit("outer", task).await.unwrap();
        let tags = rig.writer.submit("read", read_tags()).await.unwrap();
        assert_eq!(tags, vec!["inline"]);
    }

    #[tokio::test]
    async fn concurrent_submitters_each_get_their_own_result() {
        let rig = test_writer(Duration::from_secs(2)).await;
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = Vec::new();
        for i in 0..8 {
            let writer = rig.writer.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let task: WriteTask<i64> = Box::new(move |conn: &mut SqliteConnection| {
                    Box::pin(async move {
                        sqlx::query("INSERT INTO log (tag) VALUES (?1)")
                            .bind(format!("w{i}"))
                            .execute(conn)
                            .await?;
                        Ok(i)
                    })
                });
                writer.submit("concurrent", task).await
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), i as i64);
        }
        let tags = rig.writer.submit("read", read_tags()).await.unwrap();
        assert_eq!(tags.len(), 8);
    }

    #[tokio::test]
    async fn shutdown_drains_then_stops() {
        let rig = test_writer(Duration::from_secs(2)).await;
        // Spawn so the enqueue actually happens before the poison pill;
        // submit futures are lazy like any other future.
        let before = tokio::spawn({
            let writer = rig.writer.clone();
            async move { writer.submit("before", append("before")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        rig.writer.shutdown();
        before.await.unwrap().unwrap();

        let after = rig.writer.submit("after", append("after")).await;
        assert!(matches!(after, Err(WriteError::Shutdown)));

        rig.tracker.close();
        rig.tracker.wait().await;
    }
}
