use thiserror::Error;

use crate::db::WriteError;

/// Errors that can come out of a tool call, classified the way the rpc
/// layer wants to report them. The important distinction for callers is
/// `Retryable` (lock contention outlasted the retry budget; resubmitting
/// is reasonable) vs. everything else. Note that an optimistic guard
/// matching zero rows is *not* an error anywhere in here -- those come
/// back as ordinary results ("not claimed", "not live", etc.).
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("bad params for {tool}: {message}")]
    InvalidParams { tool: String, message: String },

    #[error("write lock contention outlasted the retry budget: {0}")]
    Retryable(String),

    /// An invariant the caller tripped over (e.g. superseding a memory
    /// that doesn't exist). The transaction was rolled back; nothing
    /// partial persisted.
    #[error("{0}")]
    Integrity(String),

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ToolError {
    pub fn invalid_params(tool: &str, message: impl ToString) -> Self {
        Self::InvalidParams {
            tool: tool.to_string(),
            message: message.to_string(),
        }
    }

    /// JSON-RPC error code for this error. The retryable code is our own
    /// from the implementation-defined range; clients key off it.
    pub fn rpc_code(&self) -> i64 {
        match self {
            ToolError::UnknownTool(_) => -32601,
            ToolError::InvalidParams { .. } => -32602,
            ToolError::Retryable(_) => -32003,
            ToolError::Integrity(_) => -32004,
            ToolError::Forbidden(_) => -32001,
            ToolError::Internal(_) => -32000,
        }
    }
}

impl From<WriteError> for ToolError {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::LockUnavailable { .. } => ToolError::Retryable(e.to_string()),
            WriteError::Task(inner) => {
                // Handler-level failures rolled the transaction back; the
                // distinction between caller mistakes and our bugs lives in
                // the anyhow chain, so report them as integrity failures.
                ToolError::Integrity(inner.to_string())
            }
            other => ToolError::Internal(anyhow::Error::new(other)),
        }
    }
}
