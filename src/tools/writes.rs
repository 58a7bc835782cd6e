//! The write tools. Each one is parsed into a [`WriteOp`] before it ever
//! touches the queue, then executed against the coordinator's connection
//! by [`run`]. Everything in here happens inside one immediate
//! transaction; return an error and the whole thing rolls back.

use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::sqlite::SqliteConnection;

use crate::app::state::HoardState;
use crate::db::{
    Artifacts, Conflicts, Documents, Duplicates, JobKind, Memories, Tasks, Tokens, TokenScope,
};
use crate::util::{now_ms, ToolError};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
/// Default claim lease on a task, for orchestrators that don't say.
const TASK_LEASE_DEFAULT_MS: i64 = 60_000;

/// A fully-validated write operation, ready to run on the writer. Cloneable
/// because the dispatch layer may resubmit it after lock contention.
#[derive(Debug, Clone)]
pub enum WriteOp {
    MemoryPut {
        agent_id: String,
        slot: String,
        scope: String,
        content: String,
        expires_at: i64,
    },
    MemorySupersede {
        agent_id: String,
        id: String,
        content: String,
        expires_at: i64,
    },
    MemoryRetract {
        id: String,
    },
    MemoryPrune,
    DocumentPut {
        agent_id: String,
        title: String,
        content: String,
    },
    ArtifactPut {
        agent_id: String,
        name: String,
        content: String,
    },
    TaskCreate {
        payload: String,
    },
    TaskClaim {
        agent_id: String,
        id: i64,
        lease_ttl_ms: i64,
    },
    TaskStart {
        agent_id: String,
        id: i64,
    },
    TaskFinish {
        agent_id: String,
        id: i64,
        ok: bool,
    },
    ConflictResolve {
        id: i64,
    },
    DuplicateResolve {
        id: i64,
    },
    TokenCreate {
        scope: TokenScope,
        comment: Option<String>,
    },
    TokenRevoke {
        id: i64,
    },
}

/// What a write op hands back: the caller-facing result, plus any jobs the
/// dispatch layer should enqueue once this transaction has committed.
#[derive(Debug)]
pub struct WriteOutcome {
    pub result: Value,
    pub hooks: Vec<(JobKind, String)>,
}

impl WriteOutcome {
    fn plain(result: Value) -> Self {
        Self {
            result,
            hooks: Vec::new(),
        }
    }
}

fn params<T: for<'de> Deserialize<'de>>(tool: &str, value: Value) -> Result<T, ToolError> {
    serde_json::from_value(value).map_err(|e| ToolError::invalid_params(tool, e))
}

impl WriteOp {
    pub fn parse(
        state: &HoardState,
        agent_id: &str,
        tool: &str,
        raw: Value,
    ) -> Result<Self, ToolError> {
        let agent_id = agent_id.to_string();
        match tool {
            "memory_put" => {
                #[derive(Deserialize)]
                struct P {
                    slot: String,
                    content: String,
                    #[serde(default = "default_scope")]
                    scope: String,
                    ttl_days: Option<i64>,
                }
                let p: P = params(tool, raw)?;
                Ok(WriteOp::MemoryPut {
                    agent_id,
                    slot: p.slot,
                    scope: p.scope,
                    content: p.content,
                    expires_at: expiry_for(state, tool, p.ttl_days)?,
                })
            }
            "memory_supersede" => {
                #[derive(Deserialize)]
                struct P {
                    id: String,
                    content: String,
                    ttl_days: Option<i64>,
                }
                let p: P = params(tool, raw)?;
                Ok(WriteOp::MemorySupersede {
                    agent_id,
                    id: p.id,
                    content: p.content,
                    expires_at: expiry_for(state, tool, p.ttl_days)?,
                })
            }
            "memory_retract" => {
                #[derive(Deserialize)]
                struct P {
                    id: String,
                }
                let p: P = params(tool, raw)?;
                Ok(WriteOp::MemoryRetract { id: p.id })
            }
            "memory_prune" => Ok(WriteOp::MemoryPrune),
            "document_put" => {
                #[derive(Deserialize)]
                struct P {
                    title: String,
                    content: String,
                }
                let p: P = params(tool, raw)?;
                Ok(WriteOp::DocumentPut {
                    agent_id,
                    title: p.title,
                    content: p.content,
                })
            }
            "artifact_put" => {
                #[derive(Deserialize)]
                struct P {
                    name: String,
                    content: String,
                }
                let p: P = params(tool, raw)?;
                Ok(WriteOp::ArtifactPut {
                    agent_id,
                    name: p.name,
                    content: p.content,
                })
            }
            "task_create" => {
                #[derive(Deserialize)]
                struct P {
                    payload: String,
                }
                let p: P = params(tool, raw)?;
                Ok(WriteOp::TaskCreate { payload: p.payload })
            }
            "task_claim" => {
                #[derive(Deserialize)]
                struct P {
                    id: i64,
                    lease_ttl_ms: Option<i64>,
                }
                let p: P = params(tool, raw)?;
                Ok(WriteOp::TaskClaim {
                    agent_id,
                    id: p.id,
                    lease_ttl_ms: p.lease_ttl_ms.unwrap_or(TASK_LEASE_DEFAULT_MS),
                })
            }
            "task_start" => {
                #[derive(Deserialize)]
                struct P {
                    id: i64,
                }
                let p: P = params(tool, raw)?;
                Ok(WriteOp::TaskStart { agent_id, id: p.id })
            }
            "task_finish" => {
                #[derive(Deserialize)]
                struct P {
                    id: i64,
                    #[serde(default = "default_true")]
                    ok: bool,
                }
                let p: P = params(tool, raw)?;
                Ok(WriteOp::TaskFinish {
                    agent_id,
                    id: p.id,
                    ok: p.ok,
                })
            }
            "conflict_resolve" => {
                #[derive(Deserialize)]
                struct P {
                    id: i64,
                }
                let p: P = params(tool, raw)?;
                Ok(WriteOp::ConflictResolve { id: p.id })
            }
            "duplicate_resolve" => {
                #[derive(Deserialize)]
                struct P {
                    id: i64,
                }
                let p: P = params(tool, raw)?;
                Ok(WriteOp::DuplicateResolve { id: p.id })
            }
            "token_create" => {
                #[derive(Deserialize)]
                struct P {
                    scope: String,
                    comment: Option<String>,
                }
                let p: P = params(tool, raw)?;
                let scope = TokenScope::from(p.scope.as_str());
                if scope == TokenScope::Invalid {
                    return Err(ToolError::invalid_params(
                        tool,
                        format!("unknown token scope {:?}", p.scope),
                    ));
                }
                Ok(WriteOp::TokenCreate {
                    scope,
                    comment: p.comment,
                })
            }
            "token_revoke" => {
                #[derive(Deserialize)]
                struct P {
                    id: i64,
                }
                let p: P = params(tool, raw)?;
                Ok(WriteOp::TokenRevoke { id: p.id })
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

fn default_scope() -> String {
    "global".to_string()
}

fn default_true() -> bool {
    true
}

fn expiry_for(state: &HoardState, tool: &str, ttl_days: Option<i64>) -> Result<i64, ToolError> {
    let days = ttl_days.unwrap_or(state.config.memory.default_ttl_days);
    if days < 0 {
        return Err(ToolError::invalid_params(tool, "ttl_days can't be negative"));
    }
    Ok(now_ms() + days * DAY_MS)
}

/// Execute a parsed write op on the coordinator's connection.
pub async fn run(conn: &mut SqliteConnection, op: WriteOp) -> anyhow::Result<WriteOutcome> {
    match op {
        WriteOp::MemoryPut {
            agent_id,
            slot,
            scope,
            content,
            expires_at,
        } => {
            let (memory, superseded) =
                Memories::put(conn, &agent_id, &slot, &scope, &content, Some(expires_at)).await?;
            let id = memory.id.clone();
            Ok(WriteOutcome {
                result: json!({ "memory": memory, "superseded": superseded }),
                hooks: memory_hooks(id),
            })
        }
        WriteOp::MemorySupersede {
            agent_id,
            id,
            content,
            expires_at,
        } => {
            match Memories::supersede(conn, &agent_id, &id, &content, Some(expires_at)).await? {
                Some(memory) => {
                    let new_id = memory.id.clone();
                    Ok(WriteOutcome {
                        result: json!({ "superseded": true, "memory": memory }),
                        hooks: memory_hooks(new_id),
                    })
                }
                // Guard miss: already superseded/retracted, or no such id.
                None => Ok(WriteOutcome::plain(
                    json!({ "superseded": false, "memory": null }),
                )),
            }
        }
        WriteOp::MemoryRetract { id } => {
            let retracted = Memories::retract(conn, &id).await?;
            let hooks = if retracted {
                // Membership of any open conflict on this slot changed.
                vec![(JobKind::DetectConflicts, id.clone())]
            } else {
                Vec::new()
            };
            Ok(WriteOutcome {
                result: json!({ "retracted": retracted }),
                hooks,
            })
        }
        WriteOp::MemoryPrune => {
            let pruned = Memories::prune(conn, now_ms()).await?;
            Ok(WriteOutcome::plain(json!({ "pruned": pruned })))
        }
        WriteOp::DocumentPut {
            agent_id,
            title,
            content,
        } => {
            let document = Documents::put(conn, &agent_id, &title, &content).await?;
            Ok(WriteOutcome::plain(json!({ "document": document })))
        }
        WriteOp::ArtifactPut {
            agent_id,
            name,
            content,
        } => {
            let artifact = Artifacts::put(conn, &agent_id, &name, content.as_bytes()).await?;
            Ok(WriteOutcome::plain(json!({ "artifact": artifact })))
        }
        WriteOp::TaskCreate { payload } => {
            let task = Tasks::create(conn, &payload).await?;
            Ok(WriteOutcome::plain(json!({ "task": task })))
        }
        WriteOp::TaskClaim {
            agent_id,
            id,
            lease_ttl_ms,
        } => {
            let claimed = Tasks::claim(conn, id, &agent_id, now_ms(), lease_ttl_ms).await?;
            Ok(WriteOutcome::plain(json!({
                "claimed": claimed.is_some(),
                "task": claimed,
            })))
        }
        WriteOp::TaskStart { agent_id, id } => {
            let started = Tasks::start(conn, id, &agent_id).await?;
            Ok(WriteOutcome::plain(json!({ "started": started })))
        }
        WriteOp::TaskFinish { agent_id, id, ok } => {
            let finished = Tasks::finish(conn, id, &agent_id, ok).await?;
            Ok(WriteOutcome::plain(json!({ "finished": finished })))
        }
        WriteOp::ConflictResolve { id } => {
            let resolved = Conflicts::resolve(conn, id, now_ms()).await?;
            Ok(WriteOutcome::plain(json!({ "resolved": resolved })))
        }
        WriteOp::DuplicateResolve { id } => {
            let resolved = Duplicates::resolve(conn, id, now_ms()).await?;
            Ok(WriteOutcome::plain(json!({ "resolved": resolved })))
        }
        WriteOp::TokenCreate { scope, comment } => {
            let (token, cleartext) = Tokens::create(conn, scope, comment.as_deref()).await?;
            Ok(WriteOutcome::plain(
                json!({ "token": token, "cleartext": cleartext }),
            ))
        }
        WriteOp::TokenRevoke { id } => {
            let revoked = Tokens::revoke(conn, id).await?;
            Ok(WriteOutcome::plain(json!({ "revoked": revoked })))
        }
    }
}

/// Every committed memory write kicks off the same three follow-ups.
fn memory_hooks(memory_id: String) -> Vec<(JobKind, String)> {
    vec![
        (JobKind::EmbedMemory, memory_id.clone()),
        (JobKind::DetectDuplicates, memory_id.clone()),
        (JobKind::DetectConflicts, memory_id),
    ]
}
