//! Connection monitor: dial, handshake, dispatch, reconnect, cancellation.
//!
//! One monitor task per account owns the socket end-to-end. Inbound frames
//! are handled strictly in arrival order because the pump awaits each
//! handler before reading the next frame; no locks are needed beyond the
//! account's session-store mutex. The outer loop redials after every
//! disconnect with the account's reconnect delay, and the cancellation
//! token closes the socket (1000 "aborted"), wakes the delay, and ends the
//! task with a final stopped status.

mod handlers;
mod status;

pub use handlers::{Dispatcher, CLIENT_NAME, GREETING};
pub use status::{ChannelStatus, DisconnectInfo, NullSink, StatusSink, WatchSink};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::bridge::UtteranceHandler;
use crate::config::ResolvedAccount;
use crate::error::{Error, Result};
use crate::protocol::{
    parse_envelope, response_error, response_result, Envelope, FrameKind, OP_HELLO, SUPPORTED_OPS,
};
use crate::session::AccountSessions;

/// How long the peer has to answer our hello.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum HandshakeOutcome {
    Established { conn_id: Option<String> },
    Aborted,
}

/// Reconnecting protocol client for one account.
pub struct ChannelMonitor {
    account: ResolvedAccount,
    dispatcher: Dispatcher,
    status_sink: Arc<dyn StatusSink>,
    status: ChannelStatus,
    cancel: CancellationToken,
    handshake_timeout: Duration,
}

/// Control handle for a spawned monitor task.
pub struct MonitorHandle {
    account_id: String,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl MonitorHandle {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Request shutdown: closes the connection and stops the redial loop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the monitor task to finish.
    pub async fn stopped(self) {
        let _ = self.task.await;
    }
}

impl ChannelMonitor {
    /// Build a monitor for a resolved account.
    ///
    /// Fails with `Error::Config` when the account is not configured —
    /// an account without a valid url and phone is never dialed.
    pub fn new(
        account: ResolvedAccount,
        sessions: Arc<Mutex<AccountSessions>>,
        bridge: Arc<dyn UtteranceHandler>,
        status_sink: Arc<dyn StatusSink>,
    ) -> Result<Self> {
        if !account.configured {
            return Err(Error::Config(format!(
                "account {} is missing a valid url or phone",
                account.account_id
            )));
        }
        let dispatcher = Dispatcher::new(account.clone(), sessions, bridge);
        Ok(Self {
            account,
            dispatcher,
            status_sink,
            status: ChannelStatus::default(),
            cancel: CancellationToken::new(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        })
    }

    /// Override the handshake timeout (default 10 s).
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// The token that shuts this monitor down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn the connect loop on the runtime.
    pub fn spawn(self) -> MonitorHandle {
        let account_id = self.account.account_id.clone();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run());
        MonitorHandle {
            account_id,
            cancel,
            task,
        }
    }

    /// Run the connect loop to completion (until cancelled).
    pub async fn run(mut self) {
        let Some(url) = self.account.url.clone() else {
            return;
        };
        let delay = Duration::from_millis(self.account.reconnect_delay_ms.max(250));

        self.status.running = true;

        while !self.cancel.is_cancelled() {
            tracing::info!(account = %self.account.account_id, url = %url, "dialing voice peer");
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    let disconnect = self.run_connection(ws).await;
                    tracing::info!(
                        account = %self.account.account_id,
                        status = %disconnect.status,
                        "disconnected"
                    );
                    if self.cancel.is_cancelled() {
                        // Only the final stopped snapshot follows cancellation.
                        break;
                    }
                    self.status.connected = false;
                    self.status.conn_id = None;
                    self.status.last_disconnect = Some(disconnect);
                    self.publish();
                }
                Err(e) => {
                    let err = Error::Transport(format!("dial failed: {e}"));
                    tracing::warn!(account = %self.account.account_id, error = %err, "connection attempt failed");
                    self.status.connected = false;
                    self.status.last_error = Some(err.to_string());
                    self.publish();
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        tracing::info!(account = %self.account.account_id, "monitor stopped");
        self.status_sink.publish(ChannelStatus {
            running: false,
            connected: false,
            last_stop_at: Some(Utc::now().timestamp_millis()),
            ..Default::default()
        });
    }

    /// Run one connection from handshake to disconnect.
    async fn run_connection(&mut self, mut ws: WsStream) -> DisconnectInfo {
        // Outbound seq is per connection, incremented before each send, so
        // the hello goes out with seq = 1.
        let mut seq: i64 = 0;

        match self.handshake(&mut ws, &mut seq).await {
            Ok(HandshakeOutcome::Established { conn_id }) => {
                tracing::info!(
                    account = %self.account.account_id,
                    conn_id = conn_id.as_deref().unwrap_or(""),
                    "handshake complete"
                );
                self.status.connected = true;
                self.status.conn_id = conn_id;
                self.status.last_error = None;
                self.status.last_connect_at = Some(Utc::now().timestamp_millis());
                self.publish();
            }
            Ok(HandshakeOutcome::Aborted) => {
                return disconnect_info("aborted", None);
            }
            Err(e) => {
                tracing::warn!(account = %self.account.account_id, error = %e, "handshake failed");
                close(&mut ws, CloseCode::Error, "handshake_failed").await;
                let reason = e.to_string();
                self.status.last_error = Some(reason.clone());
                return disconnect_info("handshake_failed", Some(reason));
            }
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    close(&mut ws, CloseCode::Normal, "aborted").await;
                    return disconnect_info("aborted", None);
                }
                frame = ws.next() => match frame {
                    None => return disconnect_info("closed", None),
                    Some(Err(e)) => {
                        self.status.last_error = Some(e.to_string());
                        return disconnect_info("transport_error", Some(e.to_string()));
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Some(info) = self.handle_text_frame(&mut ws, &mut seq, &text).await {
                            return info;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let status = frame
                            .as_ref()
                            .map(|f| u16::from(f.code).to_string())
                            .unwrap_or_else(|| "closed".to_string());
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        return disconnect_info(&status, reason);
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    /// Parse, dispatch, and answer one text frame. Returns `Some` when the
    /// connection must end (send failure).
    async fn handle_text_frame(
        &mut self,
        ws: &mut WsStream,
        seq: &mut i64,
        text: &str,
    ) -> Option<DisconnectInfo> {
        let env = match parse_envelope(text) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(account = %self.account.account_id, error = %e, "dropping unparseable frame");
                return None;
            }
        };
        // Inbound seq is logged, not enforced.
        tracing::debug!(
            account = %self.account.account_id,
            op = %env.op,
            seq = env.seq,
            "inbound frame"
        );

        match self.dispatcher.dispatch(&env).await {
            Ok(Some(payload)) => {
                *seq += 1;
                let response = Envelope::response(&env, *seq, payload);
                let json = match response.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(account = %self.account.account_id, error = %e, "failed to serialize response");
                        return None;
                    }
                };
                if let Err(e) = ws.send(Message::Text(json)).await {
                    self.status.last_error = Some(e.to_string());
                    return Some(disconnect_info("transport_error", Some(e.to_string())));
                }
            }
            Ok(None) => {}
            Err(e) => {
                // Handler failure: log and report, send no reply, keep the
                // connection.
                tracing::warn!(
                    account = %self.account.account_id,
                    op = %env.op,
                    error = %e,
                    "handler failed"
                );
                self.status.last_error = Some(e.to_string());
                self.publish();
            }
        }
        None
    }

    /// Send our hello and wait for the matching successful response. Every
    /// other frame is ignored until the handshake settles. Fails with
    /// `Error::Transport` when the socket gives out and `Error::Protocol`
    /// when the peer rejects, times out, or garbles the hello.
    async fn handshake(
        &mut self,
        ws: &mut WsStream,
        seq: &mut i64,
    ) -> Result<HandshakeOutcome> {
        *seq += 1;
        let hello = Envelope::request(OP_HELLO, None, *seq, self.hello_payload());
        let hello_req_id = hello.req_id.clone().unwrap_or_default();
        let json = hello.to_json()?;
        ws.send(Message::Text(json))
            .await
            .map_err(|e| Error::Transport(format!("failed to send hello: {e}")))?;

        let deadline = sleep(self.handshake_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    close(ws, CloseCode::Normal, "aborted").await;
                    return Ok(HandshakeOutcome::Aborted);
                }
                _ = &mut deadline => {
                    return Err(Error::Protocol("handshake timed out".to_string()));
                }
                frame = ws.next() => match frame {
                    None => {
                        return Err(Error::Transport(
                            "connection closed during handshake".to_string(),
                        ));
                    }
                    Some(Err(e)) => {
                        return Err(Error::Transport(format!(
                            "transport error during handshake: {e}"
                        )));
                    }
                    Some(Ok(Message::Text(text))) => {
                        let Ok(env) = parse_envelope(&text) else {
                            tracing::debug!("ignoring unparseable frame during handshake");
                            continue;
                        };
                        if env.kind != FrameKind::Res
                            || env.req_id.as_deref() != Some(hello_req_id.as_str())
                        {
                            tracing::debug!(op = %env.op, "ignoring frame before handshake completes");
                            continue;
                        }
                        return match response_result(&env.payload) {
                            Some(result) => Ok(HandshakeOutcome::Established {
                                conn_id: result
                                    .get("conn_id")
                                    .and_then(Value::as_str)
                                    .map(str::to_string),
                            }),
                            None => match response_error(&env.payload) {
                                Some((code, message)) => Err(Error::Protocol(format!(
                                    "hello rejected: {code}: {message}"
                                ))),
                                None => Err(Error::Protocol(
                                    "malformed hello response payload".to_string(),
                                )),
                            },
                        };
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Err(Error::Transport(
                            "connection closed during handshake".to_string(),
                        ));
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    fn hello_payload(&self) -> Map<String, Value> {
        let payload = json!({
            "client": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
                "phone": self.account.phone.clone().unwrap_or_default(),
            },
            "supports": { "ops": SUPPORTED_OPS },
        });
        match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn publish(&self) {
        self.status_sink.publish(self.status.clone());
    }
}

async fn close(ws: &mut WsStream, code: CloseCode, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = ws.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "close frame not delivered");
    }
}

fn disconnect_info(status: &str, error: Option<String>) -> DisconnectInfo {
    DisconnectInfo {
        at: Utc::now().timestamp_millis(),
        status: status.to_string(),
        error,
    }
}
