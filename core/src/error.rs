use std::io;
use std::time::Duration;

use drydock_protocol::SessionState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DrydockErr>;

#[derive(Error, Debug)]
pub enum DrydockErr {
    /// Malformed script, unknown profile, unknown target, malformed RPC
    /// parameters.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unknown session id, unmapped virtual path.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write without a writable shadow, socket attempt, and similar
    /// operations the sandbox refuses by construction.
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// The profile matched `always_deny`.
    #[error("denied: {0}")]
    Denied(String),

    /// The session directory is owned by another supervisor or replayer.
    #[error("session {0} is locked by another owner")]
    Locked(String),

    /// TTL elapsed before the session reached a terminal state.
    #[error("session {0} expired before approval")]
    Expired(String),

    /// A supervisor or replay op exceeded its wall-clock budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The framed channel hit EOF before the child finished cleanly.
    #[error("sandboxed child crashed: {0}")]
    ChildCrashed(String),

    /// The remote executor lost its transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// The child sent bytes that are not a legal frame. Fatal to the
    /// channel; surfaces as `ChildCrashed` at the session boundary.
    #[error("framed channel protocol violation: {0}")]
    Protocol(String),

    #[error("illegal session state transition: {from} -> {to}")]
    IllegalTransition {
        from: SessionState,
        to: SessionState,
    },

    /// Invariant violation: capture index gap, torn state file, poisoned
    /// lock. Fatal to the affected session only.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DrydockErr {
    /// Stable JSON-RPC error code mapping. Everything not listed in the
    /// table (transport loss, child crashes, channel violations) shares the
    /// -32099 bucket.
    pub fn rpc_error_code(&self) -> i64 {
        match self {
            DrydockErr::InvalidInput(_) => -32602,
            DrydockErr::NotFound(_) => -32000,
            DrydockErr::Denied(_) | DrydockErr::NotPermitted(_) => -32001,
            DrydockErr::Locked(_) => -32002,
            DrydockErr::Expired(_) => -32003,
            DrydockErr::Timeout(_) => -32004,
            DrydockErr::IllegalTransition { .. }
            | DrydockErr::Internal(_)
            | DrydockErr::Io(_)
            | DrydockErr::Json(_) => -32603,
            DrydockErr::ChildCrashed(_) | DrydockErr::Transport(_) | DrydockErr::Protocol(_) => {
                -32099
            }
        }
    }

    /// Errno-like code used in error-reply frames on the framed channel.
    /// The restricted interpreter translates these into its own exception
    /// surface, so the values follow the host's errno table.
    pub fn errno_code(&self) -> i32 {
        match self {
            DrydockErr::NotFound(_) => libc::ENOENT,
            DrydockErr::NotPermitted(_) | DrydockErr::Denied(_) => libc::EPERM,
            DrydockErr::InvalidInput(_) => libc::EINVAL,
            DrydockErr::Timeout(_) => libc::ETIMEDOUT,
            DrydockErr::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }
}
