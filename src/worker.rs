//! The background job worker. Lives inside the server process, draining
//! the persistent job queue: embeddings, duplicate detection, conflict
//! detection, and a retention sweep. All of its writes ride the write
//! coordinator like everybody else's -- it must NOT take the write lock
//! file itself, because the coordinator already does that per transaction
//! and a second acquisition from this process would self-contend.
//!
//! Exactly one worker per host drains at a time, enforced by the singleton
//! lease row: hold it, renew it at a third of its TTL, and stop draining
//! the moment a renewal comes back with zero affected rows. Jobs are
//! advisory post-write work; a failed one gets retried a few times, gets
//! its error written on the row, and never bothers the write that spawned
//! it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqliteConnection;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DuplicatesConfig, WorkerConfig};
use crate::db::{
    Conflicts, Db, Duplicates, Job, JobKind, Jobs, Memories, MemoryStatus, WorkerLease, WriteTask,
};
use crate::embed::{cosine_similarity, from_blob, to_blob, Embedder};
use crate::util::{now_ms, uuid_string};

/// Label written on conflict rows so you can tell which detector found
/// them.
const DETECTOR_LABEL: &str = "slot_scope_live";

/// How long to idle between queue checks when there's nothing to do.
const IDLE_POLL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct Worker {
    db: Db,
    embedder: Arc<dyn Embedder>,
    holder_id: String,
    lease_ttl_ms: i64,
    retention_ms: i64,
    dup_threshold: f64,
}

impl Worker {
    pub fn new(
        db: Db,
        embedder: Arc<dyn Embedder>,
        worker: &WorkerConfig,
        duplicates: &DuplicatesConfig,
    ) -> Self {
        Self {
            db,
            embedder,
            holder_id: format!("pid{}-{}", std::process::id(), &uuid_string()[..8]),
            lease_ttl_ms: worker.lease_ttl_ms,
            retention_ms: worker.job_retention_hours * 60 * 60 * 1000,
            dup_threshold: duplicates.threshold,
        }
    }

    /// Long-running worker loop. About the timing: if our process just
    /// started, requests may want the db writer immediately, so we pause
    /// before first touching the lease.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancel_token: CancellationToken) {
        info!(holder = %self.holder_id, "starting background worker; pausing before first lease attempt");
        select! {
            _ = tokio::time::sleep(Duration::from_secs(5)) => {},
            _ = cancel_token.cancelled() => return,
        }
        let renew_every = Duration::from_millis((self.lease_ttl_ms / 3).max(1) as u64);
        loop {
            if cancel_token.is_cancelled() {
                break;
            }
            match self.acquire_or_renew_lease().await {
                Ok(true) => {
                    // We hold the lease; drain until the next renewal is due.
                    if let Err(e) = self.drain_until(renew_every, &cancel_token).await {
                        error!("job drain pass failed: {e}; better luck next time");
                    }
                }
                Ok(false) => {
                    debug!("another worker holds the lease; standing by");
                    select! {
                        _ = tokio::time::sleep(Duration::from_millis(self.lease_ttl_ms as u64)) => {},
                        _ = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!("lease renewal errored: {e}");
                    select! {
                        _ = tokio::time::sleep(IDLE_POLL) => {},
                        _ = cancel_token.cancelled() => break,
                    }
                }
            }
        }
        info!("shutting down background worker");
    }

    /// Guarded upsert on the singleton lease row. True means we hold it
    /// for the next TTL; false means someone else does -- don't drain.
    pub async fn acquire_or_renew_lease(&self) -> anyhow::Result<bool> {
        let holder = self.holder_id.clone();
        let ttl = self.lease_ttl_ms;
        let task: WriteTask<bool> = Box::new(move |conn: &mut SqliteConnection| {
            Box::pin(
                async move { WorkerLease::acquire_or_renew(conn, &holder, ttl, now_ms()).await },
            )
        });
        Ok(self.db.writer.submit("worker_lease", task).await?)
    }

    /// Pull and run jobs until the renewal deadline, the queue runs dry,
    /// or we're cancelled.
    async fn drain_until(
        &self,
        renew_every: Duration,
        cancel_token: &CancellationToken,
    ) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + renew_every;
        loop {
            if cancel_token.is_cancelled() || tokio::time::Instant::now() >= deadline {
                return Ok(());
            }
            if self.run_one_job().await? {
                continue;
            }
            // Queue's dry: do the cheap housekeeping, then nap.
            self.sweep_old_jobs().await?;
            select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                _ = tokio::time::sleep(IDLE_POLL) => {}, // check the queue again
                _ = cancel_token.cancelled() => return Ok(()),
            }
        }
    }

    /// Claim and execute at most one job. Returns false when the queue is
    /// empty.
    pub async fn run_one_job(&self) -> anyhow::Result<bool> {
        let claim: WriteTask<Option<Job>> =
            Box::new(|conn: &mut SqliteConnection| Box::pin(Jobs::claim_next(conn)));
        let Some(job) = self.db.writer.submit("job_claim", claim).await? else {
            return Ok(false);
        };

        debug!(job = job.id, kind = ?job.kind(), target = %job.target_id, "running job");
        let outcome = self.execute(&job).await;
        let id = job.id;
        match outcome {
            Ok(()) => {
                let done: WriteTask<bool> = Box::new(move |conn: &mut SqliteConnection| {
                    Box::pin(async move { Jobs::mark_done(conn, id, now_ms()).await })
                });
                self.db.writer.submit("job_done", done).await?;
            }
            Err(e) => {
                warn!(job = id, "job failed: {e:#}");
                let message = format!("{e:#}");
                let failed: WriteTask<bool> = Box::new(move |conn: &mut SqliteConnection| {
                    Box::pin(async move { Jobs::mark_failed(conn, id, &message, now_ms()).await })
                });
                self.db.writer.submit("job_failed", failed).await?;
            }
        }
        Ok(true)
    }

    async fn execute(&self, job: &Job) -> anyhow::Result<()> {
        match job.kind() {
            JobKind::EmbedMemory => self.embed_memory(&job.target_id).await,
            JobKind::DetectDuplicates => self.detect_duplicates(&job.target_id).await,
            JobKind::DetectConflicts => self.detect_conflicts(&job.target_id).await,
            JobKind::Invalid => anyhow::bail!("job {} has an unknown kind", job.id),
        }
    }

    /// The embedding pipeline is deliberately three steps: the fast write
    /// that created the memory already happened; here we compute the
    /// vector *outside* any transaction, then attach it with a small
    /// guarded write. If the memory stopped being live in the meantime,
    /// the guard just misses and that's fine.
    async fn embed_memory(&self, memory_id: &str) -> anyhow::Result<()> {
        let Some(memory) = self.db.memories().get_by_id(memory_id).await? else {
            debug!(memory = %memory_id, "memory vanished before embedding; skipping");
            return Ok(());
        };
        if memory.status() != MemoryStatus::Live {
            return Ok(());
        }

        let blob = to_blob(&self.embedder.embed(&memory.content));

        let id = memory_id.to_string();
        let attach: WriteTask<bool> = Box::new(move |conn: &mut SqliteConnection| {
            Box::pin(async move { Memories::attach_embedding(conn, &id, &blob).await })
        });
        let attached = self.db.writer.submit("attach_embedding", attach).await?;
        if !attached {
            debug!(memory = %memory_id, "embedding guard missed (superseded or already embedded)");
        }
        Ok(())
    }

    /// Compare the target's embedding against every other live, embedded
    /// memory and record the pairs above threshold. The scan reads a
    /// committed snapshot; only the recording goes to the writer.
    async fn detect_duplicates(&self, memory_id: &str) -> anyhow::Result<()> {
        let Some(blob) = Memories::embedding_of(&self.db.read_pool, memory_id).await? else {
            // Not embedded yet. If it's still live, the embed job hasn't
            // landed; fail so the attempt counter retries us after it.
            let still_live = self
                .db
                .memories()
                .get_by_id(memory_id)
                .await?
                .map(|m| m.status() == MemoryStatus::Live)
                .unwrap_or(false);
            if still_live {
                anyhow::bail!("memory {memory_id} has no embedding yet");
            }
            return Ok(());
        };
        let Some(target) = from_blob(&blob) else {
            anyhow::bail!("memory {memory_id} has a corrupt embedding blob");
        };

        let candidates = Memories::live_embedded_except(&self.db.read_pool, memory_id).await?;
        let mut pairs = Vec::new();
        for (other_id, other_blob) in candidates {
            let Some(other) = from_blob(&other_blob) else {
                warn!(memory = %other_id, "skipping corrupt embedding blob");
                continue;
            };
            let score = cosine_similarity(&target, &other);
            if score >= self.dup_threshold {
                pairs.push((other_id, score));
            }
        }
        if pairs.is_empty() {
            return Ok(());
        }

        let id = memory_id.to_string();
        let record: WriteTask<()> = Box::new(move |conn: &mut SqliteConnection| {
            Box::pin(async move {
                for (other_id, score) in &pairs {
                    Duplicates::record(conn, &id, other_id, *score).await?;
                }
                Ok(())
            })
        });
        self.db.writer.submit("record_duplicates", record).await?;
        Ok(())
    }

    /// Re-derive the conflict state of the target's slot from the live
    /// rows. This runs entirely on the writer so membership is decided on
    /// the authoritative state, not a stale snapshot: two or more live
    /// owners means an open conflict with exactly those members; fewer
    /// means any open conflict for the slot is stale and gets closed.
    async fn detect_conflicts(&self, memory_id: &str) -> anyhow::Result<()> {
        let Some((slot, scope)) = Memories::slot_of(&self.db.read_pool, memory_id).await? else {
            return Ok(());
        };
        let check: WriteTask<bool> = Box::new(move |conn: &mut SqliteConnection| {
            Box::pin(async move {
                let live = Memories::live_in_slot(&mut *conn, &slot, &scope).await?;
                let owners: HashSet<&str> = live.iter().map(|(_, a)| a.as_str()).collect();
                if owners.len() >= 2 {
                    let members: Vec<String> = live.into_iter().map(|(id, _)| id).collect();
                    Conflicts::record_open(conn, &slot, &scope, &members, DETECTOR_LABEL).await?;
                    Ok(true)
                } else {
                    Conflicts::resolve_stale(conn, &slot, &scope, now_ms()).await?;
                    Ok(false)
                }
            })
        });
        let open = self.db.writer.submit("detect_conflicts", check).await?;
        if open {
            info!(memory = %memory_id, "recorded an open conflict");
        }
        Ok(())
    }

    /// Delete terminal jobs past the retention window.
    pub async fn sweep_old_jobs(&self) -> anyhow::Result<u64> {
        let cutoff = now_ms() - self.retention_ms;
        let sweep: WriteTask<u64> = Box::new(move |conn: &mut SqliteConnection| {
            Box::pin(async move { Jobs::sweep_terminal(conn, cutoff).await })
        });
        let swept = self.db.writer.submit("job_sweep", sweep).await?;
        if swept > 0 {
            debug!("swept {swept} old jobs");
        }
        Ok(swept)
    }

    /// Drain everything currently pending. Test and CLI convenience; the
    /// serving loop uses the deadline-bounded drain instead.
    pub async fn drain_queue(&self) -> anyhow::Result<u64> {
        let mut ran = 0;
        while self.run_one_job().await? {
            ran += 1;
        }
        Ok(ran)
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("holder_id", &self.holder_id)
            .field("lease_ttl_ms", &self.lease_ttl_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TestDb;
    use crate::embed::TrigramEmbedder;

    fn test_worker(db: &TestDb) -> Worker {
        Worker::new(
            db.db.clone(),
            Arc::new(TrigramEmbedder),
            &db.config.worker,
            &db.config.duplicates,
        )
    }

    async fn put_memory(db: &TestDb, agent: &str, slot: &str, content: &str) -> String {
        let (agent, slot, content) = (
            agent.to_string(),
            slot.to_string(),
            content.to_string(),
        );
        let task: WriteTask<String> = Box::new(move |conn: &mut SqliteConnection| {
            Box::pin(async move {
                let (memory, _) =
                    Memories::put(conn, &agent, &slot, "global", &content, None).await?;
                Ok(memory.id)
            })
        });
        db.writer.submit("test_put", task).await.unwrap()
    }

    async fn enqueue(db: &TestDb, kind: JobKind, target: &str) {
        let target = target.to_string();
        let task: WriteTask<i64> = Box::new(move |conn: &mut SqliteConnection| {
            Box::pin(async move { Jobs::enqueue(conn, kind, &target).await })
        });
        db.writer.submit("test_enqueue", task).await.unwrap();
    }

    #[tokio::test]
    async fn lease_is_a_singleton() {
        let db = Db::new_test_db().await;
        let first = test_worker(&db);
        let second = test_worker(&db);

        assert!(first.acquire_or_renew_lease().await.unwrap());
        // A different holder can't steal a live lease...
        assert!(!second.acquire_or_renew_lease().await.unwrap());
        // ...but the holder itself renews freely.
        assert!(first.acquire_or_renew_lease().await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let db = Db::new_test_db().await;
        let mut first = test_worker(&db);
        // A lease that has already expired by the time it's written.
        first.lease_ttl_ms = -1_000;
        assert!(first.acquire_or_renew_lease().await.unwrap());

        let second = test_worker(&db);
        assert!(second.acquire_or_renew_lease().await.unwrap());
        let (holder, _) = WorkerLease::current(&db.read_pool).await.unwrap().unwrap();
        assert_eq!(holder, second.holder_id);
    }

    #[tokio::test]
    async fn embed_job_attaches_a_vector() {
        let db = Db::new_test_db().await;
        let worker = test_worker(&db);
        let id = put_memory(&db, "agent-a", "prd", "PRD test memory").await;

        enqueue(&db, JobKind::EmbedMemory, &id).await;
        assert!(worker.run_one_job().await.unwrap());
        assert!(!worker.run_one_job().await.unwrap()); // queue's dry

        let blob = Memories::embedding_of(&db.read_pool, &id)
            .await
            .unwrap()
            .expect("embedding should be attached");
        assert_eq!(from_blob(&blob).unwrap().len(), crate::embed::EMBEDDING_DIM);

        let jobs = db.jobs().list(Some("done"), 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_detection_finds_near_matches_only() {
        let db = Db::new_test_db().await;
        let worker = test_worker(&db);
        let a = put_memory(&db, "agent-a", "note-1", "renew the tls certificate before june").await;
        let b = put_memory(&db, "agent-b", "note-2", "renew the tls certificates before june!").await;
        let c = put_memory(&db, "agent-c", "note-3", "grocery list: eggs, flour, coffee").await;

        for id in [&a, &b, &c] {
            enqueue(&db, JobKind::EmbedMemory, id).await;
        }
        enqueue(&db, JobKind::DetectDuplicates, &a).await;
        worker.drain_queue().await.unwrap();

        let dupes = db.duplicates().list_open(10).await.unwrap();
        assert_eq!(dupes.len(), 1);
        let pair = &dupes[0];
        let mut expected = [a.clone(), b.clone()];
        expected.sort();
        assert_eq!([pair.memory_a.clone(), pair.memory_b.clone()], expected);
        assert!(pair.score >= 0.85);
    }

    #[tokio::test]
    async fn conflict_detection_opens_and_then_clears() {
        let db = Db::new_test_db().await;
        let worker = test_worker(&db);
        let a = put_memory(&db, "agent-a", "owner", "Alice").await;
        let b = put_memory(&db, "agent-b", "owner", "Bob").await;

        enqueue(&db, JobKind::DetectConflicts, &a).await;
        worker.drain_queue().await.unwrap();

        let open = db.conflicts().list_open(10).await.unwrap();
        assert_eq!(open.len(), 1);
        let mut members = open[0].members();
        members.sort();
        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(members, expected);

        // Retract one side; a re-run of the detector closes the conflict.
        let retract_id = b.clone();
        let task: WriteTask<bool> = Box::new(move |conn: &mut SqliteConnection| {
            Box::pin(async move { Memories::retract(conn, &retract_id).await })
        });
        assert!(db.writer.submit("test_retract", task).await.unwrap());
        enqueue(&db, JobKind::DetectConflicts, &b).await;
        worker.drain_queue().await.unwrap();

        assert!(db.conflicts().list_open(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_jobs_retry_then_go_terminal() {
        let db = Db::new_test_db().await;
        let worker = test_worker(&db);
        // A duplicates job for a live memory that never got embedded fails
        // (embed job missing), retries, and eventually lands in 'failed'.
        let id = put_memory(&db, "agent-a", "slot", "unembedded").await;
        enqueue(&db, JobKind::DetectDuplicates, &id).await;

        for _ in 0..crate::db::JOB_MAX_ATTEMPTS {
            worker.run_one_job().await.unwrap();
        }
        let failed = db.jobs().list(Some("failed"), 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].last_error.is_some());

        // Terminal jobs get swept once they age out.
        let mut aged = test_worker(&db);
        aged.retention_ms = -1000; // everything is already too old
        assert_eq!(aged.sweep_old_jobs().await.unwrap(), 1);
    }
}
