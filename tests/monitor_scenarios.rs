//! End-to-end monitor scenarios against a real in-process WebSocket peer.
//!
//! The test server binds 127.0.0.1:0 and accepts raw tungstenite
//! connections, playing the voice front-end role: it answers (or withholds)
//! the hello, then drives session ops and asserts the bridge's responses.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use voxbridge::bridge::{AgentBridge, AgentClient, AgentRequest, UtteranceHandler};
use voxbridge::config::{MarkdownConfig, ResolvedAccount};
use voxbridge::monitor::{ChannelMonitor, ChannelStatus, MonitorHandle, WatchSink, GREETING};
use voxbridge::protocol::Action;
use voxbridge::session::AccountSessions;

type ServerWs = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

async fn bind_server() -> (String, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://127.0.0.1:{}", listener.local_addr().unwrap().port());
    (url, listener)
}

async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

async fn recv_json(ws: &mut ServerWs) -> Value {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection ended")
            .expect("websocket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {:?}", frame),
            _ => {}
        }
    }
}

async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Drain until the peer's close frame arrives; returns (code, reason).
async fn wait_close(ws: &mut ServerWs) -> (u16, String) {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for close");
        match frame {
            Some(Ok(Message::Close(Some(frame)))) => {
                return (u16::from(frame.code), frame.reason.to_string())
            }
            Some(Ok(Message::Close(None))) => return (1005, String::new()),
            Some(Ok(_)) => {}
            Some(Err(_)) | None => panic!("connection ended without a close frame"),
        }
    }
}

fn hello_ok(hello: &Value) -> Value {
    json!({
        "v": 1, "type": "res", "req_id": hello["req_id"], "session_id": null,
        "seq": 1, "ts": "2025-01-01T00:00:00.000Z", "op": "system.hello",
        "payload": { "ok": true, "result": {
            "conn_id": "C1",
            "server": { "name": "fortivoice", "version": "7.6" },
            "heartbeat_sec": 30,
            "dedupe_ttl_sec": 300
        }}
    })
}

/// Complete the hello exchange from the server side.
async fn complete_handshake(ws: &mut ServerWs) -> Value {
    let hello = recv_json(ws).await;
    assert_eq!(hello["op"], "system.hello");
    send_json(ws, hello_ok(&hello)).await;
    hello
}

async fn wait_status<F>(rx: &mut watch::Receiver<ChannelStatus>, pred: F) -> ChannelStatus
where
    F: Fn(&ChannelStatus) -> bool,
{
    timeout(WAIT, async {
        loop {
            {
                let status = rx.borrow();
                if pred(&status) {
                    return status.clone();
                }
            }
            if rx.changed().await.is_err() {
                let status = rx.borrow();
                assert!(pred(&status), "status stream ended at {:?}", *status);
                return status.clone();
            }
        }
    })
    .await
    .expect("status condition not reached")
}

fn test_account(url: &str) -> ResolvedAccount {
    ResolvedAccount {
        account_id: "default".to_string(),
        enabled: true,
        configured: true,
        name: None,
        phone: Some("+15550100".to_string()),
        url: Some(url.to_string()),
        reconnect_delay_ms: 250,
        hello_world_on_start: true,
        markdown: MarkdownConfig::default(),
    }
}

struct Harness {
    handle: MonitorHandle,
    sessions: Arc<Mutex<AccountSessions>>,
    status_rx: watch::Receiver<ChannelStatus>,
}

impl Harness {
    async fn stop(self) {
        self.handle.stop();
        self.handle.stopped().await;
    }
}

/// Spawn a monitor whose realtime utterances go through the full
/// AgentBridge pipeline backed by `agent`.
fn spawn_with_agent(url: &str, agent: Arc<dyn AgentClient>) -> Harness {
    let account = test_account(url);
    let sessions = Arc::new(Mutex::new(AccountSessions::default()));
    let bridge = Arc::new(AgentBridge::new(
        account.account_id.clone(),
        account.markdown.clone(),
        agent,
        sessions.clone(),
    ));
    spawn_monitor(account, sessions, bridge, Duration::from_secs(10))
}

fn spawn_monitor(
    account: ResolvedAccount,
    sessions: Arc<Mutex<AccountSessions>>,
    bridge: Arc<dyn UtteranceHandler>,
    handshake_timeout: Duration,
) -> Harness {
    let (sink, status_rx) = WatchSink::new();
    let monitor = ChannelMonitor::new(account, sessions.clone(), bridge, sink)
        .unwrap()
        .with_handshake_timeout(handshake_timeout);
    Harness {
        handle: monitor.spawn(),
        sessions,
        status_rx,
    }
}

/// Agent client replying with one fixed block, counting invocations.
struct ScriptedAgent {
    reply: String,
    invocations: AtomicUsize,
}

impl ScriptedAgent {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            invocations: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn dispatch(
        &self,
        _request: AgentRequest,
        blocks: mpsc::Sender<String>,
    ) -> voxbridge::Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let _ = blocks.send(self.reply.clone()).await;
        Ok(())
    }
}

/// UtteranceHandler stub for tests that never reach the agent.
struct SilentBridge;

#[async_trait]
impl UtteranceHandler for SilentBridge {
    async fn handle_utterance(
        &self,
        _session_id: &str,
        _text: &str,
    ) -> voxbridge::Result<Vec<Action>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_success_then_requests_are_handled() {
    let (url, listener) = bind_server().await;
    let sessions = Arc::new(Mutex::new(AccountSessions::default()));
    let mut harness = spawn_monitor(
        test_account(&url),
        sessions,
        Arc::new(SilentBridge),
        Duration::from_secs(10),
    );
    let mut server = accept(&listener).await;

    // Outbound hello: seq 1, req frame, phone in payload.
    let hello = recv_json(&mut server).await;
    assert_eq!(hello["v"], 1);
    assert_eq!(hello["type"], "req");
    assert_eq!(hello["op"], "system.hello");
    assert_eq!(hello["seq"], 1);
    assert_eq!(hello["payload"]["client"]["phone"], "+15550100");
    assert!(hello["payload"]["supports"]["ops"]
        .as_array()
        .unwrap()
        .contains(&json!("session.update")));

    send_json(&mut server, hello_ok(&hello)).await;
    let status = wait_status(&mut harness.status_rx, |s| s.connected).await;
    assert_eq!(status.conn_id.as_deref(), Some("C1"));

    // Any subsequent request is handled.
    send_json(
        &mut server,
        json!({
            "v": 1, "type": "req", "req_id": "q1", "session_id": null, "seq": 2,
            "ts": "2025-01-01T00:00:01.000Z", "op": "system.ping",
            "payload": { "nonce": "n1" }
        }),
    )
    .await;
    let res = recv_json(&mut server).await;
    assert_eq!(res["type"], "res");
    assert_eq!(res["req_id"], "q1");
    assert_eq!(res["op"], "system.ping");
    assert_eq!(res["seq"], 2);
    assert_eq!(res["payload"]["result"]["nonce"], "n1");

    harness.stop().await;
}

#[tokio::test]
async fn handshake_timeout_closes_1011_and_redials() {
    let (url, listener) = bind_server().await;
    let mut harness = spawn_monitor(
        test_account(&url),
        Arc::new(Mutex::new(AccountSessions::default())),
        Arc::new(SilentBridge),
        Duration::from_millis(300),
    );

    // First connection: say nothing and let the handshake timer fire.
    let mut server = accept(&listener).await;
    let _hello = recv_json(&mut server).await;
    let (code, reason) = wait_close(&mut server).await;
    assert_eq!(code, 1011);
    assert_eq!(reason, "handshake_failed");

    let status = wait_status(&mut harness.status_rx, |s| s.last_error.is_some()).await;
    assert!(status.last_error.unwrap().contains("timed out"));

    // After reconnectDelayMs the monitor redials; seq restarts at 1.
    let mut server2 = accept(&listener).await;
    let hello2 = recv_json(&mut server2).await;
    assert_eq!(hello2["seq"], 1);

    harness.stop().await;
}

#[tokio::test]
async fn handshake_rejection_closes_1011() {
    let (url, listener) = bind_server().await;
    let harness = spawn_monitor(
        test_account(&url),
        Arc::new(Mutex::new(AccountSessions::default())),
        Arc::new(SilentBridge),
        Duration::from_secs(10),
    );

    let mut server = accept(&listener).await;
    let hello = recv_json(&mut server).await;
    send_json(
        &mut server,
        json!({
            "v": 1, "type": "res", "req_id": hello["req_id"], "seq": 1,
            "ts": "2025-01-01T00:00:00.000Z", "op": "system.hello",
            "payload": { "ok": false, "error": { "code": "forbidden", "message": "nope" } }
        }),
    )
    .await;

    let (code, reason) = wait_close(&mut server).await;
    assert_eq!(code, 1011);
    assert_eq!(reason, "handshake_failed");

    harness.stop().await;
}

#[tokio::test]
async fn session_start_drains_queue_after_greeting() {
    let (url, listener) = bind_server().await;
    let sessions = Arc::new(Mutex::new(AccountSessions::default()));
    let harness = spawn_monitor(
        test_account(&url),
        sessions.clone(),
        Arc::new(SilentBridge),
        Duration::from_secs(10),
    );
    let mut server = accept(&listener).await;
    complete_handshake(&mut server).await;

    // Enqueue "hi" for s1 before the start turn.
    {
        let mut store = harness.sessions.lock().await;
        store.track("s1", None);
        store.queue_text("s1", "hi");
    }

    send_json(
        &mut server,
        json!({
            "v": 1, "type": "req", "req_id": "q1", "session_id": "s1", "seq": 2,
            "ts": "2025-01-01T00:00:01.000Z", "op": "session.start",
            "payload": { "call": { "call_id": "c1" } }
        }),
    )
    .await;
    let res = recv_json(&mut server).await;
    assert_eq!(res["req_id"], "q1");
    assert_eq!(res["session_id"], "s1");

    let actions = res["payload"]["result"]["actions"].as_array().unwrap();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0]["type"], "speak");
    assert_eq!(actions[0]["text"], GREETING);
    assert_eq!(actions[1]["type"], "speak");
    assert_eq!(actions[1]["text"], "hi");
    assert!(actions[1]["message_id"]
        .as_str()
        .unwrap()
        .starts_with("queued-"));

    // Queue was drained atomically.
    assert!(sessions.lock().await.consume_queue("s1").is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn realtime_update_yields_speak_then_collect() {
    let (url, listener) = bind_server().await;
    let agent = ScriptedAgent::new("Which city?");
    let harness = spawn_with_agent(&url, agent.clone());
    let mut server = accept(&listener).await;
    complete_handshake(&mut server).await;

    send_json(
        &mut server,
        json!({
            "v": 1, "type": "req", "req_id": "q2", "session_id": "s1", "seq": 2,
            "ts": "2025-01-01T00:00:01.000Z", "op": "session.update",
            "payload": { "realtime": { "turn_id": "t1", "input": {
                "type": "user_utterance", "text": "What is the weather today?"
            }}}
        }),
    )
    .await;
    let res = recv_json(&mut server).await;
    let actions = res["payload"]["result"]["actions"].as_array().unwrap();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0]["type"], "speak");
    assert_eq!(actions[0]["text"], "Which city?");
    assert_eq!(actions[1]["type"], "collect");
    assert_eq!(
        actions[1]["schema"]["fields"],
        json!([{ "key": "city", "type": "string", "required": true }])
    );
    assert_eq!(agent.invocations.load(Ordering::SeqCst), 1);

    harness.stop().await;
}

#[tokio::test]
async fn partial_transcript_never_reaches_the_agent() {
    let (url, listener) = bind_server().await;
    let agent = ScriptedAgent::new("never spoken");
    let harness = spawn_with_agent(&url, agent.clone());
    let mut server = accept(&listener).await;
    complete_handshake(&mut server).await;

    send_json(
        &mut server,
        json!({
            "v": 1, "type": "req", "req_id": "q3", "session_id": "s1", "seq": 2,
            "ts": "2025-01-01T00:00:01.000Z", "op": "session.update",
            "payload": { "realtime": { "turn_id": "t1", "input": {
                "type": "transcript_partial", "text": "what is the"
            }}}
        }),
    )
    .await;
    let res = recv_json(&mut server).await;
    assert_eq!(res["payload"]["ok"], true);
    assert_eq!(res["payload"]["result"]["actions"], json!([]));
    assert_eq!(agent.invocations.load(Ordering::SeqCst), 0);

    harness.stop().await;
}

#[tokio::test]
async fn session_end_event_evicts_without_reply() {
    let (url, listener) = bind_server().await;
    let sessions = Arc::new(Mutex::new(AccountSessions::default()));
    let harness = spawn_monitor(
        test_account(&url),
        sessions.clone(),
        Arc::new(SilentBridge),
        Duration::from_secs(10),
    );
    let mut server = accept(&listener).await;
    complete_handshake(&mut server).await;

    // Establish s1 with call c1 through a start turn.
    send_json(
        &mut server,
        json!({
            "v": 1, "type": "req", "req_id": "q1", "session_id": "s1", "seq": 2,
            "ts": "2025-01-01T00:00:01.000Z", "op": "session.start",
            "payload": { "call": { "call_id": "c1" } }
        }),
    )
    .await;
    recv_json(&mut server).await;

    // End event, then a ping. The first frame back must answer the ping:
    // frames are processed in order and the event got no reply.
    send_json(
        &mut server,
        json!({
            "v": 1, "type": "evt", "session_id": "s1", "seq": 3,
            "ts": "2025-01-01T00:00:02.000Z", "op": "session.end", "payload": {}
        }),
    )
    .await;
    send_json(
        &mut server,
        json!({
            "v": 1, "type": "req", "req_id": "q2", "session_id": null, "seq": 4,
            "ts": "2025-01-01T00:00:03.000Z", "op": "system.ping", "payload": {}
        }),
    )
    .await;
    let res = recv_json(&mut server).await;
    assert_eq!(res["op"], "system.ping");
    assert_eq!(res["req_id"], "q2");

    let store = sessions.lock().await;
    assert_eq!(store.resolve(Some("session:s1")), None);
    assert_eq!(store.resolve(Some("call:c1")), None);
    drop(store);

    harness.stop().await;
}

#[tokio::test]
async fn unknown_op_and_missing_session_id_get_error_responses() {
    let (url, listener) = bind_server().await;
    let harness = spawn_monitor(
        test_account(&url),
        Arc::new(Mutex::new(AccountSessions::default())),
        Arc::new(SilentBridge),
        Duration::from_secs(10),
    );
    let mut server = accept(&listener).await;
    complete_handshake(&mut server).await;

    send_json(
        &mut server,
        json!({
            "v": 1, "type": "req", "req_id": "q1", "session_id": null, "seq": 2,
            "ts": "2025-01-01T00:00:01.000Z", "op": "system.reboot", "payload": {}
        }),
    )
    .await;
    let res = recv_json(&mut server).await;
    assert_eq!(res["payload"]["ok"], false);
    assert_eq!(res["payload"]["error"]["code"], "unsupported_op");

    send_json(
        &mut server,
        json!({
            "v": 1, "type": "req", "req_id": "q2", "session_id": null, "seq": 3,
            "ts": "2025-01-01T00:00:02.000Z", "op": "session.start", "payload": {}
        }),
    )
    .await;
    let res = recv_json(&mut server).await;
    assert_eq!(res["payload"]["ok"], false);
    assert_eq!(res["payload"]["error"]["code"], "invalid_session");

    harness.stop().await;
}

#[tokio::test]
async fn outbound_seq_is_strictly_increasing() {
    let (url, listener) = bind_server().await;
    let harness = spawn_monitor(
        test_account(&url),
        Arc::new(Mutex::new(AccountSessions::default())),
        Arc::new(SilentBridge),
        Duration::from_secs(10),
    );
    let mut server = accept(&listener).await;
    let hello = complete_handshake(&mut server).await;
    assert_eq!(hello["seq"], 1);

    for i in 0..3 {
        send_json(
            &mut server,
            json!({
                "v": 1, "type": "req", "req_id": format!("q{i}"), "session_id": null,
                "seq": 2 + i, "ts": "2025-01-01T00:00:01.000Z",
                "op": "system.ping", "payload": {}
            }),
        )
        .await;
    }
    let mut last = 1;
    for _ in 0..3 {
        let res = recv_json(&mut server).await;
        let seq = res["seq"].as_i64().unwrap();
        assert_eq!(seq, last + 1);
        last = seq;
    }

    harness.stop().await;
}

#[tokio::test]
async fn unparseable_frames_are_dropped_and_connection_survives() {
    let (url, listener) = bind_server().await;
    let harness = spawn_monitor(
        test_account(&url),
        Arc::new(Mutex::new(AccountSessions::default())),
        Arc::new(SilentBridge),
        Duration::from_secs(10),
    );
    let mut server = accept(&listener).await;
    complete_handshake(&mut server).await;

    server
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();
    send_json(
        &mut server,
        json!({
            "v": 2, "type": "req", "req_id": "bad", "seq": 2,
            "ts": "2025-01-01T00:00:01.000Z", "op": "system.ping", "payload": {}
        }),
    )
    .await;

    // Connection still answers the next well-formed request.
    send_json(
        &mut server,
        json!({
            "v": 1, "type": "req", "req_id": "good", "session_id": null, "seq": 3,
            "ts": "2025-01-01T00:00:02.000Z", "op": "system.ping", "payload": {}
        }),
    )
    .await;
    let res = recv_json(&mut server).await;
    assert_eq!(res["req_id"], "good");

    harness.stop().await;
}

#[tokio::test]
async fn cancellation_closes_1000_and_publishes_final_status() {
    let (url, listener) = bind_server().await;
    let sessions = Arc::new(Mutex::new(AccountSessions::default()));
    let mut harness = spawn_monitor(
        test_account(&url),
        sessions,
        Arc::new(SilentBridge),
        Duration::from_secs(10),
    );
    let mut server = accept(&listener).await;
    complete_handshake(&mut server).await;
    wait_status(&mut harness.status_rx, |s| s.connected).await;

    harness.handle.stop();
    let (code, reason) = wait_close(&mut server).await;
    assert_eq!(code, 1000);
    assert_eq!(reason, "aborted");

    harness.handle.stopped().await;
    let status = harness.status_rx.borrow().clone();
    assert!(!status.running);
    assert!(!status.connected);
    assert!(status.last_stop_at.is_some());
}

#[tokio::test]
async fn frames_before_handshake_completion_are_ignored() {
    let (url, listener) = bind_server().await;
    let harness = spawn_monitor(
        test_account(&url),
        Arc::new(Mutex::new(AccountSessions::default())),
        Arc::new(SilentBridge),
        Duration::from_secs(10),
    );
    let mut server = accept(&listener).await;
    let hello = recv_json(&mut server).await;

    // A request before the hello response must get no reply.
    send_json(
        &mut server,
        json!({
            "v": 1, "type": "req", "req_id": "early", "session_id": null, "seq": 1,
            "ts": "2025-01-01T00:00:00.000Z", "op": "system.ping", "payload": {}
        }),
    )
    .await;
    send_json(&mut server, hello_ok(&hello)).await;

    // The next frame we receive must be the answer to a post-handshake
    // ping, not the early one.
    send_json(
        &mut server,
        json!({
            "v": 1, "type": "req", "req_id": "late", "session_id": null, "seq": 2,
            "ts": "2025-01-01T00:00:01.000Z", "op": "system.ping", "payload": {}
        }),
    )
    .await;
    let res = recv_json(&mut server).await;
    assert_eq!(res["req_id"], "late");

    harness.stop().await;
}
