//! Generic in-process pub/sub hub for real-time streaming.
//!
//! Provides topic-keyed broadcast channels for pushing job events and
//! progress-token notifications to transport adapters. Topics are opaque
//! strings — the hub has no knowledge of what's being streamed.
//!
//! Subscribers that cannot keep up fall behind on the bounded broadcast ring
//! and receive a `Lagged` error on their next `recv`; the publisher is never
//! blocked.
//!
//! # Usage
//!
//! Producers (job manager):
//!   hub.publish("job:abc-123", json!({"type": "synthesis_chunk", ...})).await;
//!
//! Consumers (SSE / notification adapters):
//!   let rx = hub.subscribe("job:abc-123").await;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Generic in-process pub/sub hub.
///
/// Thread-safe, cloneable. Keyed by string topics.
/// Payloads are `serde_json::Value` — domains serialize their own types.
#[derive(Clone)]
pub struct StreamHub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<serde_json::Value>>>>,
    capacity: usize,
}

impl StreamHub {
    /// Create a new StreamHub with default capacity (256 messages per channel).
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a new StreamHub with the given channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Publish a JSON value to a topic. No-op if no subscribers.
    pub async fn publish(&self, topic: &str, value: serde_json::Value) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(topic) {
            // Ignore send errors (no active receivers)
            let _ = tx.send(value);
        }
    }

    /// Subscribe to a topic. Creates the channel if it doesn't exist.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<serde_json::Value> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    /// Remove channels with zero subscribers (housekeeping).
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_subscribe_roundtrip() {
        let hub = StreamHub::new();
        let mut rx = hub.subscribe("job:test").await;

        let value = serde_json::json!({"type": "synthesis_chunk", "content": "hello"});
        hub.publish("job:test", value.clone()).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received, value);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = StreamHub::new();
        // Should not panic
        hub.publish("nobody:listening", serde_json::json!({"data": "dropped"}))
            .await;
    }

    #[tokio::test]
    async fn cleanup_removes_empty_channels() {
        let hub = StreamHub::new();
        let rx = hub.subscribe("ephemeral:topic").await;

        assert_eq!(hub.channels.read().await.len(), 1);

        drop(rx);
        hub.cleanup().await;

        assert_eq!(hub.channels.read().await.len(), 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_each_event() {
        let hub = StreamHub::new();
        let mut rx1 = hub.subscribe("job:multi").await;
        let mut rx2 = hub.subscribe("job:multi").await;

        let value = serde_json::json!({"type": "progress"});
        hub.publish("job:multi", value.clone()).await;

        assert_eq!(rx1.recv().await.unwrap(), value);
        assert_eq!(rx2.recv().await.unwrap(), value);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let hub = StreamHub::with_capacity(4);
        let mut rx = hub.subscribe("job:slow").await;

        for i in 0..16 {
            hub.publish("job:slow", serde_json::json!({"n": i})).await;
        }

        // The first recv reports the overflow; the publisher was never blocked.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert!(missed > 0),
            other => panic!("expected lag, got {:?}", other),
        }
    }
}
