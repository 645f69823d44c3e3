//! VoxBridge — FortiVoice-to-agent bridge
//!
//! VoxBridge connects a voice-telephony front-end (which terminates calls,
//! performs speech-to-text and text-to-speech, and manages audio I/O) to an
//! agent back-end. It dials the voice peer over a persistent WebSocket,
//! speaks a versioned request/response/event protocol, keeps per-account
//! session state in memory, and turns caller utterances into agent
//! invocations whose replies come back as voice actions (speak a line,
//! collect slot values, end the call).
//!
//! ```text
//! ┌──────────────┐  ws://  ┌───────────────────────────────────────────┐
//! │  Voice peer  │◄───────►│                VoxBridge                  │
//! │  (FortiVoice)│  JSON   │  monitor ── protocol ── session store     │
//! └──────────────┘ frames  │     │                                     │
//!                          │  bridge adapter ──► agent back-end        │
//!                          └───────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: envelope codec and the voice action model
//! - [`session`]: per-account session registry, call index, outbound queues
//! - [`config`]: shared + per-account configuration and the account resolver
//! - [`monitor`]: dial, handshake, ordered dispatch, reconnect, cancellation
//! - [`bridge`]: utterance → agent request → streamed reply → actions
//!
//! The monitor never owns its collaborators: the session store is handed in
//! per account, the agent sits behind the [`bridge::UtteranceHandler`]
//! capability, and status flows out through a [`monitor::StatusSink`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod session;

pub use bridge::{AgentBridge, AgentClient, EchoAgent, UtteranceHandler};
pub use config::{BridgeConfig, ChannelConfig, ResolvedAccount, CHANNEL};
pub use error::{Error, Result};
pub use monitor::{ChannelMonitor, ChannelStatus, MonitorHandle, StatusSink, WatchSink};
pub use protocol::{Action, Envelope, FrameKind};
pub use session::{AccountSessions, QueuedMessage, Session, SessionStore};
