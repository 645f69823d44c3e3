//! Channel status reporting.
//!
//! The monitor is write-only towards the status surface: it publishes
//! [`ChannelStatus`] snapshots through a [`StatusSink`] and never reads
//! back. Host applications usually subscribe via [`WatchSink`].

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

/// Point-in-time status of one account's connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub running: bool,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_disconnect: Option<DisconnectInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connect_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stop_at: Option<i64>,
}

/// Why and when the last connection ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectInfo {
    /// Unix ms
    pub at: i64,
    /// Close code or a short reason tag ("aborted", "handshake_failed", ...)
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Write-only status consumer.
pub trait StatusSink: Send + Sync {
    fn publish(&self, status: ChannelStatus);
}

/// Sink that drops every update.
#[derive(Debug, Default)]
pub struct NullSink;

impl StatusSink for NullSink {
    fn publish(&self, _status: ChannelStatus) {}
}

/// Sink backed by a `tokio::sync::watch` channel; subscribers always see
/// the latest snapshot.
pub struct WatchSink {
    tx: watch::Sender<ChannelStatus>,
}

impl WatchSink {
    pub fn new() -> (Arc<Self>, watch::Receiver<ChannelStatus>) {
        let (tx, rx) = watch::channel(ChannelStatus::default());
        (Arc::new(Self { tx }), rx)
    }
}

impl StatusSink for WatchSink {
    fn publish(&self, status: ChannelStatus) {
        let _ = self.tx.send(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_sink_delivers_latest() {
        let (sink, rx) = WatchSink::new();
        assert!(!rx.borrow().connected);

        sink.publish(ChannelStatus {
            running: true,
            connected: true,
            ..Default::default()
        });
        assert!(rx.borrow().connected);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = ChannelStatus {
            running: false,
            connected: false,
            last_stop_at: Some(123),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["lastStopAt"], 123);
        assert!(json.get("lastError").is_none());
    }
}
