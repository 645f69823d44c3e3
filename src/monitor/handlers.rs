//! Post-handshake operation dispatch.
//!
//! One [`Dispatcher`] per connection. `dispatch` returns the response
//! payload to send (`Ok(Some)`), nothing for events (`Ok(None)`), or the
//! handler failure for the monitor to log and report — the connection
//! stays up in every case.

use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use std::sync::Arc;

use crate::bridge::UtteranceHandler;
use crate::config::ResolvedAccount;
use crate::error::Result;
use crate::protocol::{
    error_payload, ok_payload, Action, Envelope, FrameKind, ERR_BAD_REQUEST, ERR_INVALID_SESSION,
    ERR_UNSUPPORTED_OP, OP_HELLO, OP_PING, OP_SESSION_END, OP_SESSION_START, OP_SESSION_UPDATE,
};
use crate::session::{AccountSessions, CallInfo, Direction};

/// Greeting spoken on session start when `helloWorldOnStart` is set.
pub const GREETING: &str = "Hello from VoxBridge! How can I help you today?";

/// Client identity reported in hello exchanges.
pub const CLIENT_NAME: &str = "voxbridge";

/// Realtime input types that reach the agent. Partial transcripts are
/// dropped so the agent only sees settled utterances.
const AGENT_INPUT_TYPES: [&str; 3] = ["user_utterance", "transcript_final", "tool_result"];

pub struct Dispatcher {
    account: ResolvedAccount,
    sessions: Arc<Mutex<AccountSessions>>,
    bridge: Arc<dyn UtteranceHandler>,
}

impl Dispatcher {
    pub fn new(
        account: ResolvedAccount,
        sessions: Arc<Mutex<AccountSessions>>,
        bridge: Arc<dyn UtteranceHandler>,
    ) -> Self {
        Self {
            account,
            sessions,
            bridge,
        }
    }

    /// Handle one inbound envelope. `Ok(Some(payload))` must be sent back
    /// as the response to this frame.
    pub async fn dispatch(&self, env: &Envelope) -> Result<Option<Map<String, Value>>> {
        match (env.kind, env.op.as_str()) {
            (FrameKind::Evt, OP_SESSION_END) => {
                self.on_session_end(env).await;
                Ok(None)
            }
            (FrameKind::Evt, op) => {
                tracing::debug!(account = %self.account.account_id, op, "ignoring event");
                Ok(None)
            }
            (FrameKind::Res, op) => {
                tracing::debug!(account = %self.account.account_id, op, "ignoring unexpected response");
                Ok(None)
            }
            (FrameKind::Req, op) => {
                let payload = match op {
                    OP_HELLO => self.on_hello(),
                    OP_PING => self.on_ping(env),
                    OP_SESSION_START => self.on_session_start(env).await?,
                    OP_SESSION_UPDATE => self.on_session_update(env).await?,
                    other => {
                        tracing::warn!(account = %self.account.account_id, op = other, "unsupported op");
                        error_payload(ERR_UNSUPPORTED_OP, &format!("unsupported op: {}", other))
                    }
                };
                Ok(Some(payload))
            }
        }
    }

    /// The peer may hello us too; answer with our identity and limits.
    fn on_hello(&self) -> Map<String, Value> {
        ok_payload(json!({
            "conn_id": Uuid::new_v4().to_string(),
            "server": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "heartbeat_sec": 30,
            "dedupe_ttl_sec": 300,
        }))
    }

    fn on_ping(&self, env: &Envelope) -> Map<String, Value> {
        match env.payload.get("nonce") {
            Some(nonce) => ok_payload(json!({ "nonce": nonce })),
            None => ok_payload(json!({})),
        }
    }

    async fn on_session_start(&self, env: &Envelope) -> Result<Map<String, Value>> {
        let Some(session_id) = require_session_id(env) else {
            return Ok(error_payload(
                ERR_INVALID_SESSION,
                "session.start requires a session_id",
            ));
        };
        let call = match parse_call(&env.payload) {
            Ok(call) => call,
            Err(message) => return Ok(error_payload(ERR_BAD_REQUEST, message)),
        };

        let queued = {
            let mut sessions = self.sessions.lock().await;
            sessions.track(session_id, call.as_ref());
            sessions.consume_queue(session_id)
        };

        let mut actions = Vec::with_capacity(queued.len() + 1);
        if self.account.hello_world_on_start {
            actions.push(Action::speak(GREETING));
        }
        actions.extend(
            queued
                .into_iter()
                .map(|m| Action::speak_with_id(m.message_id, m.text)),
        );

        tracing::info!(
            account = %self.account.account_id,
            session_id,
            actions = actions.len(),
            "session started"
        );
        Ok(ok_payload(json!({ "actions": actions })))
    }

    async fn on_session_update(&self, env: &Envelope) -> Result<Map<String, Value>> {
        let Some(session_id) = require_session_id(env) else {
            return Ok(error_payload(
                ERR_INVALID_SESSION,
                "session.update requires a session_id",
            ));
        };
        let call = match parse_call(&env.payload) {
            Ok(call) => call,
            Err(message) => return Ok(error_payload(ERR_BAD_REQUEST, message)),
        };
        let realtime = match parse_realtime(&env.payload) {
            Ok(realtime) => realtime,
            Err(message) => return Ok(error_payload(ERR_BAD_REQUEST, message)),
        };

        let queued = {
            let mut sessions = self.sessions.lock().await;
            sessions.track(session_id, call.as_ref());
            sessions.consume_queue(session_id)
        };
        let mut actions: Vec<Action> = queued
            .into_iter()
            .map(|m| Action::speak_with_id(m.message_id, m.text))
            .collect();

        if let Some(input) = realtime {
            if AGENT_INPUT_TYPES.contains(&input.input_type.as_str()) {
                tracing::debug!(
                    account = %self.account.account_id,
                    session_id,
                    turn_id = %input.turn_id,
                    "invoking agent"
                );
                match self.bridge.handle_utterance(session_id, &input.text).await {
                    Ok(agent_actions) => actions.extend(agent_actions),
                    Err(e) => {
                        // The response still carries the drained actions;
                        // an agent outage must not fail the turn.
                        tracing::warn!(
                            account = %self.account.account_id,
                            session_id,
                            error = %e,
                            "agent invocation failed"
                        );
                    }
                }
            } else {
                tracing::debug!(
                    session_id,
                    input_type = %input.input_type,
                    "dropping realtime input type"
                );
            }
        }

        Ok(ok_payload(json!({ "actions": actions })))
    }

    async fn on_session_end(&self, env: &Envelope) {
        let Some(session_id) = env
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            tracing::debug!(
                account = %self.account.account_id,
                "session.end event without session_id, ignoring"
            );
            return;
        };
        self.sessions.lock().await.end(session_id);
        tracing::info!(account = %self.account.account_id, session_id, "session ended");
    }
}

fn require_session_id(env: &Envelope) -> Option<&str> {
    env.session_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Read the optional `call` sub-object. Absent (or null) is fine; any other
/// non-object shape is a `bad_request`.
fn parse_call(payload: &Map<String, Value>) -> std::result::Result<Option<CallInfo>, &'static str> {
    let call = match payload.get("call") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(call)) => call,
        Some(_) => return Err("call must be an object"),
    };
    let get = |key: &str| call.get(key).and_then(Value::as_str).map(str::to_string);
    Ok(Some(CallInfo {
        call_id: get("call_id"),
        from: get("from"),
        to: get("to"),
        direction: call
            .get("direction")
            .and_then(Value::as_str)
            .and_then(Direction::parse),
    }))
}

struct RealtimeInput {
    turn_id: String,
    input_type: String,
    text: String,
}

/// Read the optional `realtime` sub-object. Non-object `realtime` or
/// `realtime.input` is a `bad_request`; a turn missing its id, type, or
/// text degrades to a drain-only update.
fn parse_realtime(
    payload: &Map<String, Value>,
) -> std::result::Result<Option<RealtimeInput>, &'static str> {
    let realtime = match payload.get("realtime") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(realtime)) => realtime,
        Some(_) => return Err("realtime must be an object"),
    };
    let input = match realtime.get("input") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(input)) => input,
        Some(_) => return Err("realtime.input must be an object"),
    };
    let (Some(turn_id), Some(input_type), Some(text)) = (
        realtime.get("turn_id").and_then(Value::as_str),
        input.get("type").and_then(Value::as_str),
        input.get("text").and_then(Value::as_str),
    ) else {
        return Ok(None);
    };
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    Ok(Some(RealtimeInput {
        turn_id: turn_id.to_string(),
        input_type: input_type.to_string(),
        text: text.to_string(),
    }))
}
