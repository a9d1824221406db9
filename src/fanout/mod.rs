//! Fan-out Hub (design notes §4.7): push live events to browser subscribers
//! without blocking ingest.
//!
//! Grounded on `routes/events.rs`'s broadcast-based SSE stream, but swapped
//! from a shared `broadcast::Sender` (lag-counted, same backlog for every
//! subscriber) to one bounded `mpsc` channel per subscriber — the design
//! notes' overflow policy is "close *that* subscriber", which a broadcast
//! channel can't express per-subscriber.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::util::{format_bytes, percentage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutEventType {
    Initial,
    Create,
    Update,
    Delete,
    Shutdown,
    Log,
}

/// One message pushed to a subscriber (design notes §4.7 payload shape).
#[derive(Debug, Clone, Serialize)]
pub struct FanoutMessage {
    pub event_type: FanoutEventType,
    pub endpoint_id: i64,
    pub instance_id: String,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

/// Derived gauges attached to tunnel-monitor messages for direct UI
/// consumption (design notes §4.7: "formatted counters, percentages").
#[derive(Debug, Clone, Serialize)]
pub struct DerivedGauges {
    pub tcp_rx_human: String,
    pub tcp_tx_human: String,
    pub udp_rx_human: String,
    pub udp_tx_human: String,
    pub pool_utilization_pct: f64,
}

impl DerivedGauges {
    #[must_use]
    pub fn compute(tcp_rx: u64, tcp_tx: u64, udp_rx: u64, udp_tx: u64, pool_used: u64, pool_capacity: u64) -> Self {
        Self {
            tcp_rx_human: format_bytes(tcp_rx),
            tcp_tx_human: format_bytes(tcp_tx),
            udp_rx_human: format_bytes(udp_rx),
            udp_tx_human: format_bytes(udp_tx),
            pool_utilization_pct: percentage(pool_used, pool_capacity),
        }
    }
}

/// What a subscriber wants to receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    AllForEndpoint(i64),
    OneTunnel { endpoint_id: i64, instance_id: String },
    SystemMonitor(i64),
}

impl Filter {
    fn matches(&self, msg: &FanoutMessage) -> bool {
        match self {
            Filter::AllForEndpoint(id) | Filter::SystemMonitor(id) => *id == msg.endpoint_id,
            Filter::OneTunnel { endpoint_id, instance_id } => {
                *endpoint_id == msg.endpoint_id && *instance_id == msg.instance_id
            }
        }
    }
}

struct Subscriber {
    id: Uuid,
    filter: Filter,
    tx: mpsc::Sender<FanoutMessage>,
}

/// Per-subscriber bounded queue (default 256, design notes §4.7). Overflow
/// closes that subscriber; it never blocks the publisher.
pub struct Hub {
    subscribers: tokio::sync::RwLock<Vec<Subscriber>>,
    queue_size: usize,
    dropped_subscribers: AtomicU64,
}

/// Handle returned to a new subscriber; dropping it unregisters.
pub struct Subscription {
    pub id: Uuid,
    pub rx: mpsc::Receiver<FanoutMessage>,
}

impl Hub {
    #[must_use]
    pub fn new(queue_size: usize) -> Self {
        Self {
            subscribers: tokio::sync::RwLock::new(Vec::new()),
            queue_size,
            dropped_subscribers: AtomicU64::new(0),
        }
    }

    pub async fn subscribe(&self, filter: Filter) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_size);
        self.subscribers.write().await.push(Subscriber { id, filter, tx });
        Subscription { id, rx }
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        self.subscribers.write().await.retain(|s| s.id != id);
    }

    /// Publishes to every matching subscriber. At-most-once delivery: a
    /// full queue drops that subscriber rather than backing up the
    /// publisher (the UI reconnects and resubscribes).
    pub async fn publish(&self, msg: FanoutMessage) {
        let mut stale = Vec::new();
        {
            let subs = self.subscribers.read().await;
            for sub in subs.iter().filter(|s| s.filter.matches(&msg)) {
                match sub.tx.try_send(msg.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscriber_id = %sub.id, "fanout queue full, dropping subscriber");
                        stale.push(sub.id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        stale.push(sub.id);
                    }
                }
            }
        }
        if !stale.is_empty() {
            self.dropped_subscribers.fetch_add(stale.len() as u64, Ordering::Relaxed);
            let mut subs = self.subscribers.write().await;
            subs.retain(|s| !stale.contains(&s.id));
        }
    }

    pub fn dropped_subscribers(&self) -> u64 {
        self.dropped_subscribers.load(Ordering::Relaxed)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(endpoint_id: i64, instance_id: &str) -> FanoutMessage {
        FanoutMessage {
            event_type: FanoutEventType::Update,
            endpoint_id,
            instance_id: instance_id.to_string(),
            payload: serde_json::json!({}),
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn filter_matches_only_target_tunnel() {
        let hub = Hub::new(8);
        let mut sub = hub
            .subscribe(Filter::OneTunnel { endpoint_id: 1, instance_id: "t1".into() })
            .await;
        hub.publish(msg(1, "t2")).await;
        hub.publish(msg(1, "t1")).await;
        let received = sub.rx.try_recv().unwrap();
        assert_eq!(received.instance_id, "t1");
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflowing_subscriber_is_dropped_not_blocked() {
        let hub = Hub::new(2);
        let sub = hub.subscribe(Filter::AllForEndpoint(1)).await;
        for _ in 0..5 {
            hub.publish(msg(1, "t1")).await;
        }
        assert_eq!(hub.subscriber_count().await, 0);
        assert_eq!(hub.dropped_subscribers(), 1);
        drop(sub);
    }

    #[test]
    fn derived_gauges_format_bytes_and_percentage() {
        let g = DerivedGauges::compute(1024, 0, 0, 0, 5, 10);
        assert_eq!(g.tcp_rx_human, "1.0 KB");
        assert_eq!(g.pool_utilization_pct, 50.0);
    }
}
