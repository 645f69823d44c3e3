//! Version-1 wire envelope codec.
//!
//! Every frame on the voice link is a JSON envelope with a fixed header
//! (`v`, `type`, `req_id`, `session_id`, `seq`, `ts`, `op`) and an
//! operation-specific `payload` object. Parsing is strict about the header
//! and lenient about the payload: unknown *ops* still parse, so the
//! dispatcher can answer them with an `unsupported_op` failure instead of
//! dropping the frame.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Protocol version spoken on the wire.
pub const PROTOCOL_VERSION: u64 = 1;

pub const OP_HELLO: &str = "system.hello";
pub const OP_PING: &str = "system.ping";
pub const OP_SESSION_START: &str = "session.start";
pub const OP_SESSION_UPDATE: &str = "session.update";
pub const OP_SESSION_END: &str = "session.end";

/// The closed operation set. Anything else is answered `unsupported_op`.
pub const SUPPORTED_OPS: [&str; 5] = [
    OP_HELLO,
    OP_PING,
    OP_SESSION_START,
    OP_SESSION_UPDATE,
    OP_SESSION_END,
];

pub const ERR_INVALID_SESSION: &str = "invalid_session";
pub const ERR_UNSUPPORTED_OP: &str = "unsupported_op";
pub const ERR_BAD_REQUEST: &str = "bad_request";

/// Frame classification carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Request: carries a `req_id` and expects a response
    Req,
    /// Response: echoes the `req_id` and `op` of its request
    Res,
    /// Event: fire-and-forget, no `req_id`
    Evt,
}

/// A parsed protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub v: u64,
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub seq: i64,
    pub ts: String,
    pub op: String,
    pub payload: Map<String, Value>,
}

/// Why a frame was rejected by [`parse_envelope`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("frame is not valid JSON")]
    InvalidJson,
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("unsupported protocol version")]
    Version,
    #[error("frame type must be req, res, or evt")]
    Kind,
    #[error("op must be a string")]
    Op,
    #[error("ts must be a string")]
    Timestamp,
    #[error("seq must be a finite number")]
    Seq,
    #[error("payload must be an object")]
    Payload,
    #[error("session_id must be a string or null")]
    SessionId,
    #[error("req_id is required for req and res frames")]
    ReqId,
}

/// Current wire timestamp (RFC 3339, millisecond precision, UTC).
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse one inbound text frame into an [`Envelope`].
pub fn parse_envelope(text: &str) -> Result<Envelope, EnvelopeError> {
    let value: Value = serde_json::from_str(text).map_err(|_| EnvelopeError::InvalidJson)?;
    let obj = value.as_object().ok_or(EnvelopeError::NotAnObject)?;

    if obj.get("v").and_then(Value::as_u64) != Some(PROTOCOL_VERSION) {
        return Err(EnvelopeError::Version);
    }

    let kind = match obj.get("type").and_then(Value::as_str) {
        Some("req") => FrameKind::Req,
        Some("res") => FrameKind::Res,
        Some("evt") => FrameKind::Evt,
        _ => return Err(EnvelopeError::Kind),
    };

    let op = obj
        .get("op")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::Op)?
        .to_string();

    let ts = obj
        .get("ts")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::Timestamp)?
        .to_string();

    let seq = match obj.get("seq") {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .ok_or(EnvelopeError::Seq)?,
        _ => return Err(EnvelopeError::Seq),
    };

    let payload = match obj.get("payload") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(EnvelopeError::Payload),
    };

    let session_id = match obj.get("session_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(EnvelopeError::SessionId),
    };

    let req_id = match obj.get("req_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(EnvelopeError::ReqId),
    };

    if matches!(kind, FrameKind::Req | FrameKind::Res)
        && req_id.as_deref().map_or(true, str::is_empty)
    {
        return Err(EnvelopeError::ReqId);
    }

    Ok(Envelope {
        v: PROTOCOL_VERSION,
        kind,
        req_id,
        session_id,
        seq,
        ts,
        op,
        payload,
    })
}

impl Envelope {
    /// Build an outbound request with a fresh `req_id`.
    pub fn request(
        op: &str,
        session_id: Option<&str>,
        seq: i64,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind: FrameKind::Req,
            req_id: Some(Uuid::new_v4().to_string()),
            session_id: session_id.map(str::to_string),
            seq,
            ts: now_ts(),
            op: op.to_string(),
            payload,
        }
    }

    /// Build the response to `request`, inheriting its `req_id`, `op`,
    /// and `session_id`.
    pub fn response(request: &Envelope, seq: i64, payload: Map<String, Value>) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind: FrameKind::Res,
            req_id: request.req_id.clone(),
            session_id: request.session_id.clone(),
            seq,
            ts: now_ts(),
            op: request.op.clone(),
            payload,
        }
    }

    /// Build an outbound event (no `req_id`).
    pub fn event(op: &str, session_id: Option<&str>, seq: i64, payload: Map<String, Value>) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind: FrameKind::Evt,
            req_id: None,
            session_id: session_id.map(str::to_string),
            seq,
            ts: now_ts(),
            op: op.to_string(),
            payload,
        }
    }

    /// Serialize to a wire text frame.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Build a success response payload: `{ ok: true, result }`.
///
/// A non-object `result` is replaced with `{}` so responses always carry
/// an object result.
pub fn ok_payload(result: Value) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("ok".to_string(), Value::Bool(true));
    let result = match result {
        Value::Object(map) => Value::Object(map),
        _ => Value::Object(Map::new()),
    };
    payload.insert("result".to_string(), result);
    payload
}

/// Build a failure response payload: `{ ok: false, error: { code, message } }`.
pub fn error_payload(code: &str, message: &str) -> Map<String, Value> {
    let mut error = Map::new();
    error.insert("code".to_string(), Value::String(code.to_string()));
    error.insert("message".to_string(), Value::String(message.to_string()));
    let mut payload = Map::new();
    payload.insert("ok".to_string(), Value::Bool(false));
    payload.insert("error".to_string(), Value::Object(error));
    payload
}

/// The `result` object of a successful response payload, if any.
pub fn response_result(payload: &Map<String, Value>) -> Option<&Map<String, Value>> {
    if payload.get("ok").and_then(Value::as_bool) == Some(true) {
        payload.get("result").and_then(Value::as_object)
    } else {
        None
    }
}

/// The `(code, message)` of a failure response payload, if any.
pub fn response_error(payload: &Map<String, Value>) -> Option<(String, String)> {
    if payload.get("ok").and_then(Value::as_bool) != Some(false) {
        return None;
    }
    let error = payload.get("error").and_then(Value::as_object);
    let code = error
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("");
    Some((code.to_string(), message.to_string()))
}
