//! Envelope codec for session commands.
//!
//! A frame is a two-level JSON document: the outer object carries a single
//! string field `cmd` holding the encoded inner document, so a transport can
//! route on the outer key without parsing the payload. The inner document
//! carries the integer `Command` discriminator, the `CollabToken` correlation
//! field, and the command payload. Decoding validates every required field
//! before use; a malformed frame is always a terminal decode failure.

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::{CapabilityDescriptor, Command, CommandKind, PartyIdentity, SourceAppRef};

/// Outer routing key.
pub const OUTER_CMD_KEY: &str = "cmd";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("field has wrong type: {0}")]
    WrongType(&'static str),

    #[error("empty field: {0}")]
    EmptyField(&'static str),

    #[error("unknown command discriminator: {0}")]
    UnknownCommand(i64),

    #[error("encoded command is {len} bytes, transport limit is {max}")]
    Oversize { len: usize, max: usize },
}

/// Encode a command into a wire frame, enforcing the transport payload cap.
pub fn encode(command: &Command, max_len: usize) -> Result<Vec<u8>, CodecError> {
    let inner = encode_inner(command);
    let outer = json!({ OUTER_CMD_KEY: inner.to_string() });
    let bytes = outer.to_string().into_bytes();
    if bytes.len() > max_len {
        return Err(CodecError::Oversize {
            len: bytes.len(),
            max: max_len,
        });
    }
    Ok(bytes)
}

/// Decode a wire frame. Phase one extracts the inner document from the outer
/// routing field; phase two validates the discriminator, token, and payload.
pub fn decode(bytes: &[u8]) -> Result<Command, CodecError> {
    let outer: Value = serde_json::from_slice(bytes)?;
    let outer = outer.as_object().ok_or(CodecError::WrongType("frame"))?;
    let inner_text = match outer.get(OUTER_CMD_KEY) {
        None => return Err(CodecError::MissingField(OUTER_CMD_KEY)),
        Some(Value::String(s)) => s,
        Some(_) => return Err(CodecError::WrongType(OUTER_CMD_KEY)),
    };

    let inner: Value = serde_json::from_str(inner_text)?;
    let inner = inner.as_object().ok_or(CodecError::WrongType("command"))?;

    let discriminator = req_i64(inner, "Command")?;
    let kind = CommandKind::from_discriminator(discriminator)?;
    let token = req_string(inner, "CollabToken")?;
    if token.is_empty() {
        return Err(CodecError::EmptyField("CollabToken"));
    }

    match kind {
        CommandKind::SinkStart => decode_sink_start(inner, token),
        CommandKind::NotifyResult => Ok(Command::NotifyResult {
            token,
            code: i32::try_from(req_i64(inner, "ResultCode")?)
                .map_err(|_| CodecError::WrongType("ResultCode"))?,
        }),
        CommandKind::Disconnect => Ok(Command::Disconnect { token }),
    }
}

fn encode_inner(command: &Command) -> Value {
    let mut inner = Map::new();
    inner.insert(
        "Command".into(),
        Value::from(command.kind().discriminator()),
    );
    inner.insert("CollabToken".into(), Value::from(command.token()));

    match command {
        Command::SinkStart {
            source_device_id,
            sink_device_id,
            source,
            app_ref,
            descriptor,
            mission_id,
            ..
        } => {
            inner.insert("SourceDeviceId".into(), Value::from(source_device_id.as_str()));
            inner.insert("SinkDeviceId".into(), Value::from(sink_device_id.as_str()));
            inner.insert("SourceBundle".into(), Value::from(source.bundle_name.as_str()));
            inner.insert("SourceAbility".into(), Value::from(source.ability_name.as_str()));
            inner.insert("SourceModule".into(), Value::from(source.module_name.as_str()));
            inner.insert("SourcePid".into(), Value::from(source.pid));
            inner.insert("SourceUid".into(), Value::from(source.uid));
            inner.insert("SourceAccessToken".into(), Value::from(source.access_token_id));
            match app_ref {
                SourceAppRef::ById { bundle_id, type_id } => {
                    inner.insert("AppRefById".into(), Value::from(true));
                    inner.insert("SourceBundleId".into(), Value::from(*bundle_id));
                    inner.insert("ContinueTypeId".into(), Value::from(*type_id));
                }
                SourceAppRef::ByName { continue_type, .. } => {
                    inner.insert("AppRefById".into(), Value::from(false));
                    inner.insert("ContinueType".into(), Value::from(continue_type.as_str()));
                }
            }
            inner.insert("NeedConfirm".into(), Value::from(descriptor.need_confirm));
            inner.insert("FreeInstall".into(), Value::from(descriptor.free_install));
            if let Some(params) = &descriptor.params {
                inner.insert("Params".into(), params.clone());
            }
            if let Some(mission_id) = mission_id {
                inner.insert("MissionId".into(), Value::from(*mission_id));
            }
        }
        Command::NotifyResult { code, .. } => {
            inner.insert("ResultCode".into(), Value::from(*code));
        }
        Command::Disconnect { .. } => {}
    }

    Value::Object(inner)
}

fn decode_sink_start(
    inner: &Map<String, Value>,
    token: String,
) -> Result<Command, CodecError> {
    let source_device_id = req_string(inner, "SourceDeviceId")?;
    let sink_device_id = req_string(inner, "SinkDeviceId")?;

    let bundle_name = req_string(inner, "SourceBundle")?;
    let source = PartyIdentity {
        device_id: source_device_id.clone(),
        pid: req_i32(inner, "SourcePid")?,
        uid: req_i32(inner, "SourceUid")?,
        access_token_id: req_u64(inner, "SourceAccessToken")?,
        bundle_name: bundle_name.clone(),
        ability_name: req_string(inner, "SourceAbility")?,
        module_name: req_string(inner, "SourceModule")?,
    };

    let app_ref = if req_bool(inner, "AppRefById")? {
        SourceAppRef::ById {
            bundle_id: req_u32(inner, "SourceBundleId")?,
            type_id: req_u32(inner, "ContinueTypeId")?,
        }
    } else {
        SourceAppRef::ByName {
            bundle_name,
            continue_type: req_string(inner, "ContinueType")?,
        }
    };

    let descriptor = CapabilityDescriptor {
        need_confirm: req_bool(inner, "NeedConfirm")?,
        free_install: req_bool(inner, "FreeInstall")?,
        params: inner.get("Params").cloned(),
    };

    let mission_id = match inner.get("MissionId") {
        None => None,
        Some(v) => Some(v.as_u64().ok_or(CodecError::WrongType("MissionId"))?),
    };

    Ok(Command::SinkStart {
        token,
        source_device_id,
        sink_device_id,
        source,
        app_ref,
        descriptor,
        mission_id,
    })
}

fn req_i64(map: &Map<String, Value>, key: &'static str) -> Result<i64, CodecError> {
    match map.get(key) {
        None => Err(CodecError::MissingField(key)),
        Some(v) => v.as_i64().ok_or(CodecError::WrongType(key)),
    }
}

fn req_i32(map: &Map<String, Value>, key: &'static str) -> Result<i32, CodecError> {
    i32::try_from(req_i64(map, key)?).map_err(|_| CodecError::WrongType(key))
}

fn req_u64(map: &Map<String, Value>, key: &'static str) -> Result<u64, CodecError> {
    match map.get(key) {
        None => Err(CodecError::MissingField(key)),
        Some(v) => v.as_u64().ok_or(CodecError::WrongType(key)),
    }
}

fn req_u32(map: &Map<String, Value>, key: &'static str) -> Result<u32, CodecError> {
    u32::try_from(req_u64(map, key)?).map_err(|_| CodecError::WrongType(key))
}

fn req_string(map: &Map<String, Value>, key: &'static str) -> Result<String, CodecError> {
    match map.get(key) {
        None => Err(CodecError::MissingField(key)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(CodecError::WrongType(key)),
    }
}

fn req_bool(map: &Map<String, Value>, key: &'static str) -> Result<bool, CodecError> {
    match map.get(key) {
        None => Err(CodecError::MissingField(key)),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(CodecError::WrongType(key)),
    }
}
