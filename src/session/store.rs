//! Per-account session state.
//!
//! Each account owns a registry of live sessions, a call-id index into it,
//! and per-session outbound queues drained on the next `session.start` or
//! `session.update`. All mutation happens from the account's dispatch task
//! or from outbound-send callers, so a single async mutex per account is
//! enough.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Call direction as reported by the voice peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    /// Parse the wire form; anything but `inbound`/`outbound` is dropped.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

/// The bridge's view of one ongoing call
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub call_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub direction: Option<Direction>,
    /// Last inbound op that named this session (unix ms)
    pub last_seen_at: i64,
}

/// Optional call metadata attached to a session op
#[derive(Debug, Clone, Default)]
pub struct CallInfo {
    pub call_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub direction: Option<Direction>,
}

/// An out-of-band text waiting to be spoken on the session's next turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedMessage {
    pub message_id: String,
    pub text: String,
    pub created_at: i64,
}

/// Session state for a single account.
#[derive(Debug, Default)]
pub struct AccountSessions {
    sessions: HashMap<String, Session>,
    call_index: HashMap<String, String>,
    queues: HashMap<String, Vec<QueuedMessage>>,
    /// Session ids in insertion order, for the latest-session fallback
    insertion: Vec<String>,
    latest_session_id: Option<String>,
}

impl AccountSessions {
    /// Upsert a session, refresh `last_seen_at`, merge call metadata, and
    /// mark it as the latest session.
    pub fn track(&mut self, session_id: &str, call: Option<&CallInfo>) {
        let now = Utc::now().timestamp_millis();
        let is_new = !self.sessions.contains_key(session_id);
        {
            let entry = self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Session {
                    session_id: session_id.to_string(),
                    call_id: None,
                    from: None,
                    to: None,
                    direction: None,
                    last_seen_at: now,
                });
            entry.last_seen_at = now;
            if let Some(call) = call {
                if let Some(call_id) = &call.call_id {
                    entry.call_id = Some(call_id.clone());
                }
                if let Some(from) = &call.from {
                    entry.from = Some(from.clone());
                }
                if let Some(to) = &call.to {
                    entry.to = Some(to.clone());
                }
                if let Some(direction) = call.direction {
                    entry.direction = Some(direction);
                }
            }
        }

        if is_new {
            self.insertion.push(session_id.to_string());
        }
        if let Some(call_id) = self.sessions.get(session_id).and_then(|s| s.call_id.clone()) {
            self.call_index.insert(call_id, session_id.to_string());
        }
        self.latest_session_id = Some(session_id.to_string());
    }

    /// Resolve a send target to a live session id.
    ///
    /// An empty or absent target resolves to the latest session. Explicit
    /// `session:` / `call:` prefixes are honoured first, then the bare id is
    /// tried as a session id and finally as a call id. A leading
    /// `fortivoice:` prefix is stripped before any of this. Prefixes match
    /// case-insensitively; the id itself is taken verbatim.
    pub fn resolve(&self, target: Option<&str>) -> Option<String> {
        let target = target.map(str::trim).unwrap_or("");
        let target = strip_prefix_ci(target, "fortivoice:").unwrap_or(target);

        if target.is_empty() {
            return self.latest_session_id.clone();
        }
        if let Some(id) = strip_prefix_ci(target, "session:") {
            return self.sessions.contains_key(id).then(|| id.to_string());
        }
        if let Some(call_id) = strip_prefix_ci(target, "call:") {
            return self.call_index.get(call_id).cloned();
        }
        if self.sessions.contains_key(target) {
            return Some(target.to_string());
        }
        self.call_index.get(target).cloned()
    }

    /// Append a text to the session's outbound queue.
    pub fn queue_text(&mut self, session_id: &str, text: &str) -> QueuedMessage {
        let message = QueuedMessage {
            message_id: format!("queued-{}", Uuid::new_v4()),
            text: text.to_string(),
            created_at: Utc::now().timestamp_millis(),
        };
        self.queues
            .entry(session_id.to_string())
            .or_default()
            .push(message.clone());
        message
    }

    /// Take the session's queued messages, clearing the queue atomically.
    pub fn consume_queue(&mut self, session_id: &str) -> Vec<QueuedMessage> {
        self.queues.remove(session_id).unwrap_or_default()
    }

    pub fn has_active_session(&self) -> bool {
        !self.sessions.is_empty()
    }

    /// Delete a session, its queue, and every call-index entry pointing at
    /// it. The latest-session pointer falls back to the most recently
    /// inserted survivor.
    pub fn end(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
        self.queues.remove(session_id);
        self.call_index.retain(|_, sid| sid != session_id);
        self.insertion.retain(|sid| sid != session_id);
        if self.latest_session_id.as_deref() == Some(session_id) {
            self.latest_session_id = self.insertion.last().cloned();
        }
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn latest_session_id(&self) -> Option<&str> {
        self.latest_session_id.as_deref()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

fn strip_prefix_ci<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}

/// Session state for all accounts, sharded by account id.
#[derive(Debug, Default)]
pub struct SessionStore {
    accounts: DashMap<String, Arc<Mutex<AccountSessions>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shard for one account, created on first use.
    pub fn account(&self, account_id: &str) -> Arc<Mutex<AccountSessions>> {
        self.accounts
            .entry(account_id.to_string())
            .or_default()
            .clone()
    }

    /// Outbound send surface: resolve `target` and enqueue `text` to be
    /// spoken on the session's next turn.
    pub async fn queue_text(
        &self,
        account_id: &str,
        target: Option<&str>,
        text: &str,
    ) -> Result<QueuedMessage> {
        let shard = self.account(account_id);
        let mut sessions = shard.lock().await;
        let session_id = sessions.resolve(target).ok_or_else(|| {
            Error::Session(format!(
                "no session matches target {:?} for account {}",
                target.unwrap_or(""),
                account_id
            ))
        })?;
        Ok(sessions.queue_text(&session_id, text))
    }

    pub async fn has_active_session(&self, account_id: &str) -> bool {
        self.account(account_id).lock().await.has_active_session()
    }
}
