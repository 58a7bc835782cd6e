//! Filesystem-backed advisory locks. Three of them, with three different
//! lifetimes:
//!
//! - [`WriteLock`]: exclusive lock on `<db>.lock`, held only while a write
//!   transaction is active. This is what serializes writers *across
//!   processes*; in-process serialization is the coordinator's job.
//! - [`ServerLock`]: exclusive lock on `<db>.server`, held for the whole
//!   lifetime of a running server. A second server trying to start on the
//!   same store gets told to go away.
//! - [`SyncLock`]: an exclusive-create lock file at `<db>.sync` guarding
//!   the connector sync pipeline.
//!
//! The first two use flock-style locks (via fs4), which are tied to the
//! open file description rather than the process. That's load-bearing in
//! both directions: a fresh open() contends correctly even against our own
//! process, and dropping the File releases exactly our claim. It also means
//! we must NOT try to take the write lock from inside code that's already
//! riding the coordinator -- that's self-contention, and the coordinator's
//! queue already provides the in-process ordering.
//!
//! Caveat that applies to all three: advisory file locks need local
//! filesystem semantics. On NFS and friends they may silently not exclude
//! anything. `hoard doctor` checks what it can, but if you put the store
//! on a network mount you're on your own.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs4::fs_std::FileExt;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::util::now_ms;

/// How long to sleep between lock-acquisition attempts. Short, because the
/// typical hold time is one small transaction.
const ACQUIRE_POLL_MS: u64 = 10;
const ACQUIRE_JITTER_MS: u64 = 5;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("couldn't acquire {what} within {waited_ms} ms (held by another writer?)")]
    Timeout { what: &'static str, waited_ms: u64 },

    #[error("another process holds the lock at {0}")]
    Held(PathBuf),

    #[error("lock file i/o at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Try to take an exclusive flock on an already-open file. Returns false on
/// contention, whichever way the platform reports it.
fn try_exclusive(file: &File) -> std::io::Result<bool> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

/// Open (creating if needed) a lock file. Never truncates: a concurrent
/// holder's diagnostic record isn't ours to clobber.
fn open_lock_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
}

/// Best-effort diagnostic record of who holds a lock. Correctness never
/// depends on reading this back.
fn write_holder_record(file: &mut File) {
    let record = format!("pid {}\nacquired {}\n", std::process::id(), now_ms());
    let _ = file.set_len(0);
    let _ = file.write_all(record.as_bytes());
    let _ = file.flush();
}

/// The cross-process database write lock. Cheap to clone around; each
/// acquisition opens its own file description.
#[derive(Clone, Debug)]
pub struct WriteLock {
    path: PathBuf,
    timeout: Duration,
}

impl WriteLock {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Single non-blocking attempt. Ok(None) means someone else has it.
    pub fn try_acquire(&self) -> Result<Option<WriteLockGuard>, LockError> {
        let mut file = open_lock_file(&self.path).map_err(|e| LockError::io(&self.path, e))?;
        if try_exclusive(&file).map_err(|e| LockError::io(&self.path, e))? {
            write_holder_record(&mut file);
            Ok(Some(WriteLockGuard {
                file,
                path: self.path.clone(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Bounded blocking acquisition: poll with a short jittered sleep until
    /// we get the lock or the configured timeout runs out. The jitter keeps
    /// two starved processes from retrying in lockstep.
    pub async fn acquire(&self) -> Result<WriteLockGuard, LockError> {
        let start = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            if start.elapsed() >= self.timeout {
                return Err(LockError::Timeout {
                    what: "the database write lock",
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            let jitter = rand::thread_rng().gen_range(0..=ACQUIRE_JITTER_MS);
            tokio::time::sleep(Duration::from_millis(ACQUIRE_POLL_MS + jitter)).await;
        }
    }
}

/// RAII guard for a held write lock.
#[derive(Debug)]
pub struct WriteLockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        // Unlock errors here are usually benign (the file description is
        // about to close and release the lock anyway).
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), "write lock unlock returned {e}");
        }
    }
}

/// The server singleton lock: acquired once at startup, held until the
/// process exits. Purely advisory, like everything else here.
#[derive(Debug)]
pub struct ServerLock {
    _file: File,
    path: PathBuf,
}

impl ServerLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let mut file = open_lock_file(path).map_err(|e| LockError::io(path, e))?;
        if try_exclusive(&file).map_err(|e| LockError::io(path, e))? {
            write_holder_record(&mut file);
            debug!(path = %path.display(), "server singleton lock acquired");
            Ok(Self {
                _file: file,
                path: path.to_path_buf(),
            })
        } else {
            Err(LockError::Held(path.to_path_buf()))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The connector-sync pipeline lock. Unlike the flock-based locks, this is
/// an exclusive-*create* file: existence IS the lock. That makes it visible
/// in `ls` while a sync runs, at the cost of needing cleanup if a sync
/// crashes hard (which `hoard doctor` will tell you about).
#[derive(Debug)]
pub struct SyncLock {
    path: PathBuf,
}

impl SyncLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        match OpenOptions::new().create_new(true).write(true).open(path) {
            Ok(mut file) => {
                write_holder_record(&mut file);
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(LockError::Held(path.to_path_buf()))
            }
            Err(e) => Err(LockError::io(path, e)),
        }
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "couldn't remove sync lock file: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_lock_excludes_second_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db.lock");
        let lock_a = WriteLock::new(path.clone(), Duration::from_millis(100));
        let lock_b = WriteLock::new(path, Duration::from_millis(100));

        // flock is per open file description, so two WriteLocks contend
        // even inside one process -- same as two processes would.
        let guard = lock_a.try_acquire().unwrap().expect("first acquire");
        assert!(lock_b.try_acquire().unwrap().is_none());

        // Bounded acquisition times out rather than hanging.
        let err = lock_b.acquire().await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));

        // Releasing the first lets the second in.
        drop(guard);
        assert!(lock_b.try_acquire().unwrap().is_some());
    }

    #[tokio::test]
    async fn write_lock_acquire_waits_out_short_holds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db.lock");
        let lock = WriteLock::new(path, Duration::from_secs(2));

        let guard = lock.try_acquire().unwrap().unwrap();
        let contender = lock.clone();
        let waiter = tokio::spawn(async move { contender.acquire().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);
        let acquired = waiter.await.unwrap();
        assert!(acquired.is_ok());
    }

    #[test]
    fn server_lock_is_a_singleton() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db.server");

        let first = ServerLock::acquire(&path).unwrap();
        let second = ServerLock::acquire(&path);
        assert!(matches!(second, Err(LockError::Held(_))));

        drop(first);
        assert!(ServerLock::acquire(&path).is_ok());
    }

    #[test]
    fn sync_lock_is_exclusive_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db.sync");

        let first = SyncLock::acquire(&path).unwrap();
        assert!(matches!(SyncLock::acquire(&path), Err(LockError::Held(_))));

        // Dropping removes the file, so the next sync can run.
        drop(first);
        assert!(!path.exists());
        assert!(SyncLock::acquire(&path).is_ok());
    }

    #[test]
    fn lock_files_record_their_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db.server");
        let _held = ServerLock::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains(&format!("pid {}", std::process::id())));
    }
}
