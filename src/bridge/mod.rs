//! Agent bridge adapter.
//!
//! Turns an inbound caller utterance into a request against the external
//! agent and coerces the agent's streamed reply into voice actions. The
//! monitor only sees the [`UtteranceHandler`] capability; the concrete
//! [`AgentBridge`] composes the external collaborators — an [`AgentClient`]
//! that streams reply blocks and a [`SessionRecorder`] for the agent-side
//! transcript — with the voice-prep pipeline (table sanitising, media
//! notices, structured-action parse, collect heuristic, chunking).

mod chunker;
mod heuristic;
mod markdown;

pub use chunker::{chunk_text, ChunkMode};
pub use heuristic::infer_city_collect;
pub use markdown::{append_media_notices, sanitize_tables, TableMode};

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::config::{MarkdownConfig, CHANNEL};
use crate::error::Result;
use crate::protocol::{parse_structured, Action};
use crate::session::AccountSessions;

/// Fixed instruction block appended to every utterance sent to the agent.
pub const ACTION_INSTRUCTIONS: &str = "\
Respond with voice actions as JSON only: a single object of the form \
{\"actions\":[...]} and no prose outside it. Supported actions:\n\
- {\"type\":\"speak\",\"message_id\":\"<unique id>\",\"text\":\"...\",\"barge_in\":true}\n\
- {\"type\":\"collect\",\"schema\":{\"fields\":[{\"key\":\"...\",\"type\":\"string|number|integer|boolean|date|datetime\",\"required\":true}]}}\n\
- {\"type\":\"end\",\"reason\":\"...\",\"transfer\":{\"to\":\"<number>\",\"mode\":\"warm|cold\"}}\n\
If no action fits, reply with plain text and it will be spoken as-is.";

/// Who the agent is talking to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerDescriptor {
    pub kind: String,
    pub id: String,
}

impl PeerDescriptor {
    /// The direct-session peer the voice channel always uses.
    pub fn direct_session(session_id: &str) -> Self {
        Self {
            kind: "direct".to_string(),
            id: format!("session:{}", session_id),
        }
    }
}

/// One utterance formatted for the external agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRequest {
    pub agent_id: String,
    /// Stable conversation key derived from channel, account, and peer
    pub session_key: String,
    pub channel: String,
    pub account_id: String,
    pub peer: PeerDescriptor,
    /// The caller's utterance, verbatim
    pub text: String,
    /// Fixed action-format instructions appended to the utterance
    pub instructions: String,
    /// When the request was formed (unix ms)
    pub sent_at: i64,
    /// `last_seen_at` of the session before this utterance, if any
    pub prior_seen_at: Option<i64>,
}

impl AgentRequest {
    /// The full prompt body: utterance plus the instruction block.
    pub fn body(&self) -> String {
        format!("{}\n\n{}", self.text, self.instructions)
    }
}

/// External agent back-end. Implementations deliver the reply as one or
/// more text blocks through `blocks` and return when the reply is complete.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn dispatch(&self, request: AgentRequest, blocks: mpsc::Sender<String>) -> Result<()>;
}

/// Agent-side transcript writer.
#[async_trait]
pub trait SessionRecorder: Send + Sync {
    async fn record_inbound(&self, request: &AgentRequest) -> Result<()>;
}

/// Recorder that only logs; used when no transcript back-end is wired.
#[derive(Debug, Default)]
pub struct LogRecorder;

#[async_trait]
impl SessionRecorder for LogRecorder {
    async fn record_inbound(&self, request: &AgentRequest) -> Result<()> {
        tracing::debug!(
            session_key = %request.session_key,
            account = %request.account_id,
            "recording inbound utterance"
        );
        Ok(())
    }
}

/// Agent client that echoes the utterance back as a single reply block.
#[derive(Debug, Default, Clone)]
pub struct EchoAgent;

#[async_trait]
impl AgentClient for EchoAgent {
    async fn dispatch(&self, request: AgentRequest, blocks: mpsc::Sender<String>) -> Result<()> {
        let _ = blocks.send(format!("Echo: {}", request.text)).await;
        Ok(())
    }
}

/// Activity counters surfaced alongside channel status.
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    actions_emitted: AtomicU64,
    last_outbound_at: AtomicI64,
}

impl BridgeMetrics {
    /// Record `count` emitted actions; a zero count changes nothing.
    pub fn record_actions(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.actions_emitted.fetch_add(count as u64, Ordering::Relaxed);
        self.last_outbound_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn actions_emitted(&self) -> u64 {
        self.actions_emitted.load(Ordering::Relaxed)
    }

    pub fn last_outbound_at(&self) -> Option<i64> {
        let at = self.last_outbound_at.load(Ordering::Relaxed);
        (at != 0).then_some(at)
    }
}

/// The capability the connection monitor depends on.
#[async_trait]
pub trait UtteranceHandler: Send + Sync {
    /// Turn an inbound caller utterance into voice actions.
    async fn handle_utterance(&self, session_id: &str, text: &str) -> Result<Vec<Action>>;
}

/// Production [`UtteranceHandler`]: routes to the agent and post-processes
/// its reply blocks into actions.
pub struct AgentBridge {
    account_id: String,
    agent_id: String,
    markdown: MarkdownConfig,
    agent: Arc<dyn AgentClient>,
    recorder: Arc<dyn SessionRecorder>,
    metrics: Arc<BridgeMetrics>,
    sessions: Arc<Mutex<AccountSessions>>,
}

impl AgentBridge {
    pub fn new(
        account_id: impl Into<String>,
        markdown: MarkdownConfig,
        agent: Arc<dyn AgentClient>,
        sessions: Arc<Mutex<AccountSessions>>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            agent_id: "default".to_string(),
            markdown,
            agent,
            recorder: Arc::new(LogRecorder),
            metrics: Arc::new(BridgeMetrics::default()),
            sessions,
        }
    }

    /// Route to a specific agent instead of the default one.
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    /// Replace the transcript recorder.
    pub fn with_recorder(mut self, recorder: Arc<dyn SessionRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        self.metrics.clone()
    }

    /// Routing context for a session: conversation key plus peer descriptor.
    fn route(&self, session_id: &str) -> (String, PeerDescriptor) {
        let peer = PeerDescriptor::direct_session(session_id);
        let session_key = format!(
            "agent:{}:{}:{}:{}",
            self.agent_id, CHANNEL, self.account_id, peer.id
        );
        (session_key, peer)
    }

    /// Post-process one delivered reply block into actions.
    fn actions_for_block(&self, user_text: &str, block: &str) -> Vec<Action> {
        let block = sanitize_tables(block, self.markdown.tables);
        let block = append_media_notices(&block);

        if let Some(actions) = parse_structured(&block) {
            return actions;
        }

        let mut actions: Vec<Action> =
            chunk_text(&block, self.markdown.text_chunk_limit, self.markdown.chunking)
                .into_iter()
                .map(Action::speak)
                .collect();
        if let Some(collect) = infer_city_collect(user_text, &block) {
            actions.push(collect);
        }
        actions
    }
}

#[async_trait]
impl UtteranceHandler for AgentBridge {
    async fn handle_utterance(&self, session_id: &str, text: &str) -> Result<Vec<Action>> {
        let (session_key, peer) = self.route(session_id);
        let prior_seen_at = self
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.last_seen_at);

        let request = AgentRequest {
            agent_id: self.agent_id.clone(),
            session_key,
            channel: CHANNEL.to_string(),
            account_id: self.account_id.clone(),
            peer,
            text: text.to_string(),
            instructions: ACTION_INSTRUCTIONS.to_string(),
            sent_at: Utc::now().timestamp_millis(),
            prior_seen_at,
        };

        self.recorder.record_inbound(&request).await?;

        let (block_tx, mut block_rx) = mpsc::channel::<String>(16);
        let dispatch = self.agent.dispatch(request, block_tx);
        let collect = async {
            let mut actions = Vec::new();
            while let Some(block) = block_rx.recv().await {
                actions.extend(self.actions_for_block(text, &block));
            }
            actions
        };

        let (dispatched, actions) = tokio::join!(dispatch, collect);
        dispatched?;

        self.metrics.record_actions(actions.len());
        Ok(actions)
    }
}
