// Error taxonomy for the execution engine

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error classification stored on every errored or failed result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Authentication rejected; the host is excluded immediately
    AuthFailed,
    /// No pool slot became free within the acquire timeout
    PoolExhausted,
    /// The task ran past its timeout
    Timeout,
    /// Session-level I/O failure (connect or exec)
    TransportError,
    /// The module itself reported failure (nonzero exit)
    ModuleFailed,
    /// The run was aborted by the caller
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::ModuleFailed => "module_failed",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// All error types in Catalyst
#[derive(Debug, Error)]
pub enum EngineError {
    /// Authentication against the host failed (permanent)
    #[error("authentication failed for {host}: {message}")]
    AuthFailed { host: String, message: String },

    /// No session slot was available in time (transient)
    #[error("connection pool exhausted for {host} after waiting {waited:?}")]
    PoolExhausted { host: String, waited: Duration },

    /// An operation exceeded its time limit
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Could not establish a session (transient)
    #[error("failed to connect to {host}: {message}")]
    Connect {
        host: String,
        message: String,
        suggestion: Option<String>,
    },

    /// A live session broke while in use (transient)
    #[error("transport error on {host}: {message}")]
    Transport { host: String, message: String },

    /// Task-logic failure (permanent)
    #[error("module '{module}' failed on {host}: {message}")]
    ModuleFailed {
        module: String,
        host: String,
        message: String,
    },

    /// A file could not be written or read on the host (permanent)
    #[error("file transfer failed on {host} for '{path}': {message}")]
    Transfer {
        host: String,
        path: String,
        message: String,
    },

    /// The run was cancelled by the caller
    #[error("cancelled")]
    Cancelled,

    /// A transient error persisted past the retry policy
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<EngineError>,
    },

    #[error("unknown module '{name}'")]
    UnknownModule { name: String },

    #[error("invalid parameters for module '{module}': {message}")]
    InvalidParams { module: String, message: String },

    /// Plan construction errors
    #[error("plan error: {message}")]
    Plan {
        message: String,
        suggestion: Option<String>,
    },

    /// Inventory errors
    #[error("inventory error: {message}")]
    Inventory {
        message: String,
        suggestion: Option<String>,
    },

    /// Engine configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
    },
}

impl EngineError {
    /// Taxonomy class used in results. Errors that never reach a result
    /// (plan, inventory, config) have no kind.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            EngineError::AuthFailed { .. } => Some(ErrorKind::AuthFailed),
            EngineError::PoolExhausted { .. } => Some(ErrorKind::PoolExhausted),
            EngineError::Timeout { .. } => Some(ErrorKind::Timeout),
            EngineError::Connect { .. } | EngineError::Transport { .. } => {
                Some(ErrorKind::TransportError)
            }
            EngineError::ModuleFailed { .. } | EngineError::Transfer { .. } => {
                Some(ErrorKind::ModuleFailed)
            }
            EngineError::Cancelled => Some(ErrorKind::Cancelled),
            EngineError::RetriesExhausted { last, .. } => last.kind(),
            EngineError::UnknownModule { .. }
            | EngineError::InvalidParams { .. }
            | EngineError::Plan { .. }
            | EngineError::Inventory { .. }
            | EngineError::Config { .. }
            | EngineError::Io { .. } => None,
        }
    }

    /// Whether the retry controller may try again. Timeouts are transient
    /// only when the policy opts in, which the controller checks itself.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::PoolExhausted { .. }
                | EngineError::Connect { .. }
                | EngineError::Transport { .. }
        )
    }

    /// Whether the session in use must be discarded instead of returned
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            EngineError::Transport { .. } | EngineError::Timeout { .. } | EngineError::Cancelled
        )
    }

    /// True when the failure happened before any session existed
    pub fn is_unreachable(&self) -> bool {
        match self {
            EngineError::AuthFailed { .. } | EngineError::Connect { .. } => true,
            EngineError::RetriesExhausted { last, .. } => last.is_unreachable(),
            _ => false,
        }
    }

    /// The innermost error, unwrapping retry exhaustion
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    /// Human hint for the most common failure causes
    pub fn suggestion(&self) -> Option<String> {
        match self {
            EngineError::Connect { suggestion, .. }
            | EngineError::Plan { suggestion, .. }
            | EngineError::Inventory { suggestion, .. } => suggestion.clone(),
            EngineError::AuthFailed { .. } => Some(
                "Ensure the SSH key is loaded in the agent, set key_file, or provide a password"
                    .to_string(),
            ),
            EngineError::PoolExhausted { .. } => {
                Some("Raise max_global / max_per_host or the acquire timeout".to_string())
            }
            EngineError::UnknownModule { .. } => {
                Some("Built-in modules are 'command', 'copy' and 'ping'".to_string())
            }
            EngineError::RetriesExhausted { last, .. } => last.suggestion(),
            _ => None,
        }
    }
}
