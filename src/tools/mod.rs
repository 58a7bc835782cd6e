//! Tool classification and transactional dispatch.
//!
//! Every tool the rpc surface exposes is statically registered here as
//! either a read or a write. Read tools run immediately against the
//! per-request read pool. Write tools get parsed up front (so bad params
//! fail before anything enqueues), wrapped into a closure, and submitted
//! to the write coordinator; the request task blocks until the
//! coordinator replies. If the coordinator reports lock contention, the
//! dispatch layer retries on the caller's behalf inside the configured
//! retry budget before giving up with a retryable error.

mod reads;
mod writes;

use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, warn};

use crate::app::state::HoardState;
use crate::db::{JobKind, Jobs, WriteTask};
use crate::util::ToolError;

pub use writes::WriteOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Read,
    Write,
}

/// The static registry. Write tools are exactly the ones that mutate core
/// entities; if it's not in this table, it's not a tool.
pub const REGISTRY: &[(&str, ToolKind)] = &[
    // reads
    ("memory_get", ToolKind::Read),
    ("memory_list", ToolKind::Read),
    ("search", ToolKind::Read),
    ("document_get", ToolKind::Read),
    ("artifact_get", ToolKind::Read),
    ("task_get", ToolKind::Read),
    ("task_list", ToolKind::Read),
    ("jobs_list", ToolKind::Read),
    ("conflicts_list", ToolKind::Read),
    ("duplicates_list", ToolKind::Read),
    ("token_list", ToolKind::Read),
    ("worker_status", ToolKind::Read),
    // writes
    ("memory_put", ToolKind::Write),
    ("memory_supersede", ToolKind::Write),
    ("memory_retract", ToolKind::Write),
    ("memory_prune", ToolKind::Write),
    ("document_put", ToolKind::Write),
    ("artifact_put", ToolKind::Write),
    ("task_create", ToolKind::Write),
    ("task_claim", ToolKind::Write),
    ("task_start", ToolKind::Write),
    ("task_finish", ToolKind::Write),
    ("conflict_resolve", ToolKind::Write),
    ("duplicate_resolve", ToolKind::Write),
    ("token_create", ToolKind::Write),
    ("token_revoke", ToolKind::Write),
];

pub fn classify(tool: &str) -> Option<ToolKind> {
    REGISTRY
        .iter()
        .find(|(name, _)| *name == tool)
        .map(|(_, kind)| *kind)
}

/// Run one tool call to completion and hand back its JSON result.
pub async fn dispatch(
    state: &HoardState,
    agent_id: &str,
    tool: &str,
    params: Value,
) -> Result<Value, ToolError> {
    // Callers that omit params entirely mean "no params".
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    match classify(tool) {
        None => Err(ToolError::UnknownTool(tool.to_string())),
        Some(ToolKind::Read) => reads::run(state, agent_id, tool, params).await,
        Some(ToolKind::Write) => {
            let op = WriteOp::parse(state, agent_id, tool, params)?;
            let outcome = submit_with_retry(state, tool, op).await?;
            enqueue_hooks(state, tool, outcome.hooks).await;
            Ok(outcome.result)
        }
    }
}

/// Submit a write op, retrying lock-unavailable failures with doubling
/// jittered backoff until the retry budget runs out. Everything else
/// propagates immediately.
async fn submit_with_retry(
    state: &HoardState,
    tool: &str,
    op: WriteOp,
) -> Result<writes::WriteOutcome, ToolError> {
    let budget = Duration::from_millis(state.config.database.retry_budget_ms);
    let mut backoff = state.config.database.retry_backoff_ms.max(1);
    let start = Instant::now();
    loop {
        let attempt_op = op.clone();
        let task: WriteTask<writes::WriteOutcome> =
            Box::new(move |conn: &mut SqliteConnection| Box::pin(writes::run(conn, attempt_op)));
        match state.db.writer.submit(tool, task).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_retryable() && start.elapsed() < budget => {
                let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
                debug!(tool, "write lock contention, retrying in {} ms", backoff + jitter);
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                backoff = (backoff * 2).min(2_000);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Post-write hooks: enqueue the follow-up jobs in their own small
/// transaction, strictly after the triggering write committed. Failures
/// here are logged and swallowed -- they must never un-succeed the write
/// the caller already saw commit.
async fn enqueue_hooks(state: &HoardState, tool: &str, hooks: Vec<(JobKind, String)>) {
    if hooks.is_empty() {
        return;
    }
    let task: WriteTask<()> = Box::new(move |conn: &mut SqliteConnection| {
        Box::pin(async move {
            for (kind, target) in &hooks {
                Jobs::enqueue(conn, *kind, target).await?;
            }
            Ok(())
        })
    });
    if let Err(e) = state.db.writer.submit("post_write_hooks", task).await {
        warn!(tool, "couldn't enqueue post-write jobs: {e}");
    }
}
