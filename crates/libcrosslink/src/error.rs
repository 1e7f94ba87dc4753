use thiserror::Error;

use crosslink_protocol::ResultCode;
use crosslink_protocol::codec::CodecError;

#[derive(Error, Debug)]
pub enum CrosslinkError {
    #[error("invalid argument: {0}")]
    InvalidArgs(String),

    #[error("continuation already in progress for mission {0}")]
    AlreadyInProgress(u64),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("session token already registered: {0}")]
    TokenCollision(String),

    #[error("session {token} is terminal ({state}), cannot move to {requested}")]
    TerminalState {
        token: String,
        state: &'static str,
        requested: &'static str,
    },

    #[error("caller identity does not match session record")]
    RelationMismatch,

    #[error("peer identity resolution failed after {attempts} attempts")]
    ResolveExhausted { attempts: u32 },

    #[error("no sink candidate matches continue type {0}")]
    NoSinkMatch(String),

    #[error("dispatcher closed")]
    DispatcherClosed,

    #[error("transport: {0}")]
    Transport(String),

    #[error("component start failed: {0}")]
    StartFailed(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CrosslinkError {
    /// Machine-readable code delivered through caller callbacks. Callers
    /// never see a bare boolean.
    pub fn to_result_code(&self) -> ResultCode {
        match self {
            CrosslinkError::ResolveExhausted { .. } | CrosslinkError::NoSinkMatch(_) => {
                ResultCode::ResolveFailed
            }
            CrosslinkError::RelationMismatch => ResultCode::PermissionDenied,
            CrosslinkError::DispatcherClosed => ResultCode::SessionShutdown,
            CrosslinkError::StartFailed(_) => ResultCode::StartFailed,
            _ => ResultCode::StartFailed,
        }
    }
}
