pub mod codec;

use serde::{Deserialize, Serialize};

/// Lower sentinel of the session command range. Not a valid command itself.
pub const SESSION_CMD_MIN: i64 = 0;
/// Upper sentinel of the session command range. Not a valid command itself.
pub const SESSION_CMD_MAX: i64 = 4;

/// Command discriminators accepted on the wire. Anything at or outside the
/// sentinel range is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Ask the sink device to start the matching ability.
    SinkStart,
    /// Report the outcome of a start back to the source.
    NotifyResult,
    /// Tear the session down.
    Disconnect,
}

impl CommandKind {
    pub fn discriminator(self) -> i64 {
        match self {
            CommandKind::SinkStart => 1,
            CommandKind::NotifyResult => 2,
            CommandKind::Disconnect => 3,
        }
    }

    pub fn from_discriminator(value: i64) -> Result<Self, codec::CodecError> {
        match value {
            1 => Ok(CommandKind::SinkStart),
            2 => Ok(CommandKind::NotifyResult),
            3 => Ok(CommandKind::Disconnect),
            other => Err(codec::CodecError::UnknownCommand(other)),
        }
    }
}

/// One side of a session: who is running (or will run) the ability.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PartyIdentity {
    pub device_id: String,
    pub pid: i32,
    pub uid: i32,
    pub access_token_id: u64,
    pub bundle_name: String,
    pub ability_name: String,
    pub module_name: String,
}

/// How the source names the application to continue: by numeric ids or by
/// an explicit continuation-type name. Both forms resolve through the same
/// algorithm on the sink.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum SourceAppRef {
    ById { bundle_id: u32, type_id: u32 },
    ByName { bundle_name: String, continue_type: String },
}

/// Capability/option descriptor carried in a start command.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityDescriptor {
    /// Sink must obtain an out-of-band connect decision before starting.
    pub need_confirm: bool,
    /// Sink may install the bundle if it is missing.
    pub free_install: bool,
    /// Opaque start parameters forwarded to the component lifecycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Machine-readable outcome codes delivered to callbacks and carried in
/// `NotifyResult` commands.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Ok,
    Timeout,
    SessionShutdown,
    Rejected,
    ResolveFailed,
    StartFailed,
    PermissionDenied,
}

impl ResultCode {
    pub fn as_i32(self) -> i32 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::Timeout => 1,
            ResultCode::SessionShutdown => 2,
            ResultCode::Rejected => 3,
            ResultCode::ResolveFailed => 4,
            ResultCode::StartFailed => 5,
            ResultCode::PermissionDenied => 6,
        }
    }

    /// Unknown wire values collapse to `StartFailed` at the call site; this
    /// returns `None` so the caller makes that choice explicitly.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(ResultCode::Ok),
            1 => Some(ResultCode::Timeout),
            2 => Some(ResultCode::SessionShutdown),
            3 => Some(ResultCode::Rejected),
            4 => Some(ResultCode::ResolveFailed),
            5 => Some(ResultCode::StartFailed),
            6 => Some(ResultCode::PermissionDenied),
            _ => None,
        }
    }

    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}

/// A decoded session command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SinkStart {
        token: String,
        source_device_id: String,
        sink_device_id: String,
        source: PartyIdentity,
        app_ref: SourceAppRef,
        descriptor: CapabilityDescriptor,
        /// Caller mission id for continuation sessions; absent for pure
        /// collaboration.
        mission_id: Option<u64>,
    },
    NotifyResult {
        token: String,
        code: i32,
    },
    Disconnect {
        token: String,
    },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::SinkStart { .. } => CommandKind::SinkStart,
            Command::NotifyResult { .. } => CommandKind::NotifyResult,
            Command::Disconnect { .. } => CommandKind::Disconnect,
        }
    }

    pub fn token(&self) -> &str {
        match self {
            Command::SinkStart { token, .. }
            | Command::NotifyResult { token, .. }
            | Command::Disconnect { token } => token,
        }
    }
}
