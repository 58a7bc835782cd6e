//! The read tools. These run straight against the read pool on the
//! calling request's task -- no queue, no lock, no transaction. WAL mode
//! means they see the latest committed snapshot no matter what the writer
//! is up to.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::state::HoardState;
use crate::db::WorkerLease;
use crate::util::ToolError;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

fn params<T: for<'de> Deserialize<'de>>(tool: &str, value: Value) -> Result<T, ToolError> {
    serde_json::from_value(value).map_err(|e| ToolError::invalid_params(tool, e))
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

pub async fn run(
    state: &HoardState,
    agent_id: &str,
    tool: &str,
    raw: Value,
) -> Result<Value, ToolError> {
    let db = &state.db;
    match tool {
        "memory_get" => {
            #[derive(Deserialize)]
            struct P {
                slot: String,
                #[serde(default = "default_scope")]
                scope: String,
            }
            let p: P = params(tool, raw)?;
            let memory = db.memories().get(&p.slot, &p.scope).await?;
            Ok(json!({ "memory": memory }))
        }
        "memory_list" => {
            #[derive(Deserialize)]
            struct P {
                scope: Option<String>,
                agent_id: Option<String>,
                limit: Option<i64>,
            }
            let p: P = params(tool, raw)?;
            let memories = db
                .memories()
                .list(p.scope.as_deref(), p.agent_id.as_deref(), clamp_limit(p.limit))
                .await?;
            Ok(json!({ "memories": memories }))
        }
        "search" => {
            #[derive(Deserialize)]
            struct P {
                query: String,
                limit: Option<i64>,
            }
            let p: P = params(tool, raw)?;
            let limit = clamp_limit(p.limit);
            let memories = db.memories().search(&p.query, limit).await?;
            let documents = db.documents().search(&p.query, limit).await?;
            Ok(json!({ "memories": memories, "documents": documents }))
        }
        "document_get" => {
            #[derive(Deserialize)]
            struct P {
                id: String,
            }
            let p: P = params(tool, raw)?;
            Ok(json!({ "document": db.documents().get(&p.id).await? }))
        }
        "artifact_get" => {
            #[derive(Deserialize)]
            struct P {
                name: String,
            }
            let p: P = params(tool, raw)?;
            let artifact = db.artifacts().get(&p.name).await?;
            // Blob content travels as (lossy) text in the json envelope.
            Ok(match artifact {
                Some(a) => {
                    let content = String::from_utf8_lossy(&a.content).into_owned();
                    json!({ "artifact": a, "content": content })
                }
                None => json!({ "artifact": null, "content": null }),
            })
        }
        "task_get" => {
            #[derive(Deserialize)]
            struct P {
                id: i64,
            }
            let p: P = params(tool, raw)?;
            Ok(json!({ "task": db.tasks().get(p.id).await? }))
        }
        "task_list" => {
            #[derive(Deserialize)]
            struct P {
                status: Option<String>,
                limit: Option<i64>,
            }
            let p: P = params(tool, raw)?;
            let tasks = db
                .tasks()
                .list(p.status.as_deref(), clamp_limit(p.limit))
                .await?;
            Ok(json!({ "tasks": tasks }))
        }
        "jobs_list" => {
            #[derive(Deserialize)]
            struct P {
                state: Option<String>,
                limit: Option<i64>,
            }
            let p: P = params(tool, raw)?;
            let jobs = db
                .jobs()
                .list(p.state.as_deref(), clamp_limit(p.limit))
                .await?;
            Ok(json!({ "jobs": jobs }))
        }
        "conflicts_list" => {
            #[derive(Deserialize)]
            struct P {
                limit: Option<i64>,
            }
            let p: P = params(tool, raw)?;
            let conflicts = db.conflicts().list_open(clamp_limit(p.limit)).await?;
            let conflicts: Vec<Value> = conflicts
                .into_iter()
                .map(|c| {
                    let members = c.members();
                    json!({ "conflict": c, "members": members })
                })
                .collect();
            Ok(json!({ "conflicts": conflicts }))
        }
        "duplicates_list" => {
            #[derive(Deserialize)]
            struct P {
                limit: Option<i64>,
            }
            let p: P = params(tool, raw)?;
            Ok(json!({ "duplicates": db.duplicates().list_open(clamp_limit(p.limit)).await? }))
        }
        "token_list" => {
            #[derive(Deserialize)]
            struct P {
                limit: Option<i64>,
            }
            let p: P = params(tool, raw)?;
            Ok(json!({ "tokens": db.tokens().list(clamp_limit(p.limit)).await? }))
        }
        "worker_status" => {
            let lease = WorkerLease::current(&db.read_pool).await?;
            let pending = db.jobs().pending_count().await?;
            Ok(json!({
                "lease": lease.map(|(holder, expires_at)| {
                    let mine = holder == agent_id;
                    json!({ "holder": holder, "expires_at": expires_at, "mine": mine })
                }),
                "pending_jobs": pending,
            }))
        }
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

fn default_scope() -> String {
    "global".to_string()
}
