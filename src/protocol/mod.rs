//! Wire protocol: envelope framing and the voice action model.

mod action;
mod envelope;

pub use action::{
    parse_structured, Action, ActionError, CollectField, CollectSchema, FieldType, Transfer,
    TransferMode, Voice,
};
pub use envelope::{
    error_payload, now_ts, ok_payload, parse_envelope, response_error, response_result, Envelope,
    EnvelopeError, FrameKind, ERR_BAD_REQUEST, ERR_INVALID_SESSION, ERR_UNSUPPORTED_OP, OP_HELLO,
    OP_PING, OP_SESSION_END, OP_SESSION_START, OP_SESSION_UPDATE, PROTOCOL_VERSION, SUPPORTED_OPS,
};
