//! The JSON-RPC 2.0 surface: one POST endpoint, method = tool name. The
//! transport is deliberately thin -- all the interesting routing happens
//! in the tools registry; this file just unwraps the envelope, figures out
//! who's calling, and wraps the result back up.

use axum::extract::State;
use axum::Json;
use http::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::state::HoardState;
use crate::db::TokenScope;
use crate::tools::{self, ToolKind};
use crate::util::ToolError;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn handle(
    State(state): State<HoardState>,
    headers: HeaderMap,
    Json(req): Json<RpcRequest>,
) -> Json<Value> {
    let id = req.id.clone().unwrap_or(Value::Null);
    match call(&state, &headers, req).await {
        Ok(result) => Json(json!({ "jsonrpc": "2.0", "id": id, "result": result })),
        Err(e) => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": e.rpc_code(), "message": e.to_string() },
        })),
    }
}

async fn call(
    state: &HoardState,
    headers: &HeaderMap,
    req: RpcRequest,
) -> Result<Value, ToolError> {
    authorize(state, headers, &req.method).await?;
    let agent_id = agent_id(state, headers);
    debug!(agent = %agent_id, tool = %req.method, "tool call");
    tools::dispatch(state, &agent_id, &req.method, req.params).await
}

/// Which agent is this? Single-tenant and local, so the attribution header
/// is trusted as-is; agents that don't say get lumped together.
fn agent_id(state: &HoardState, headers: &HeaderMap) -> String {
    headers
        .get(&state.config.agent_header)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

/// Token check, slacker mode: no Authorization header means the caller is
/// a local process we trust (this is a single-user data layer, not a
/// public API). If a bearer token IS presented, it has to be real, and
/// read-scoped tokens don't get to call write tools.
async fn authorize(
    state: &HoardState,
    headers: &HeaderMap,
    method: &str,
) -> Result<(), ToolError> {
    let Some(raw) = headers.get(http::header::AUTHORIZATION) else {
        return Ok(());
    };
    let cleartext = raw
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ToolError::Forbidden("malformed authorization header"))?;
    let token = state
        .db
        .tokens()
        .authenticate(cleartext)
        .await?
        .ok_or(ToolError::Forbidden("unknown or revoked token"))?;
    if token.scope() == TokenScope::Read && tools::classify(method) == Some(ToolKind::Write) {
        return Err(ToolError::Forbidden("read-scoped token on a write tool"));
    }
    Ok(())
}
