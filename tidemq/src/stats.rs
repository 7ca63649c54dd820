//! Broker counters read by the informational stats endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;

use crate::context::ServerContext;
use crate::utils::{format_timestamp, timestamp_secs, Counter, Timestamp};

#[derive(Debug)]
pub struct Stats {
    pub started: Timestamp,
    pub connections: Counter,
    pub messages_received: AtomicUsize,
    pub messages_sent: AtomicUsize,
    pub messages_dropped: AtomicUsize,
    pub bytes_received: AtomicUsize,
    pub bytes_sent: AtomicUsize,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self {
            started: timestamp_secs(),
            connections: Counter::new(),
            messages_received: AtomicUsize::new(0),
            messages_sent: AtomicUsize::new(0),
            messages_dropped: AtomicUsize::new(0),
            bytes_received: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn received(&self, payload_len: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(payload_len, Ordering::Relaxed);
    }

    #[inline]
    pub fn sent(&self, payload_len: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(payload_len, Ordering::Relaxed);
    }

    #[inline]
    pub fn dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn uptime(&self) -> Timestamp {
        (timestamp_secs() - self.started).max(0)
    }

    pub fn to_json(&self, scx: &ServerContext) -> serde_json::Value {
        let inflight: usize = scx.sessions.iter().map(|e| e.info.inflights()).sum();
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "started": format_timestamp(self.started),
            "uptime": self.uptime(),
            "clients_connected": self.connections.count(),
            "clients_maximum": self.connections.max(),
            "subscriptions": scx.router.routes(),
            "retained": scx.retain.count(),
            "inflight": inflight,
            "messages_received": self.messages_received.load(Ordering::Relaxed),
            "messages_sent": self.messages_sent.load(Ordering::Relaxed),
            "messages_dropped": self.messages_dropped.load(Ordering::Relaxed),
            "bytes_received": self.bytes_received.load(Ordering::Relaxed),
            "bytes_sent": self.bytes_sent.load(Ordering::Relaxed),
        })
    }
}
