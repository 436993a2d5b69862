//! Delivery counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::message::DeliveryPath;

/// Live counters, updated from every delivery path.
#[derive(Debug, Default)]
pub struct TransportStats {
    sent_direct: AtomicU64,
    sent_ice: AtomicU64,
    queued_offline: AtomicU64,
    send_failures: AtomicU64,
    received_tcp: AtomicU64,
    received_ice: AtomicU64,
    received_offline: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sent_direct: u64,
    pub sent_ice: u64,
    pub queued_offline: u64,
    pub send_failures: u64,
    pub received_tcp: u64,
    pub received_ice: u64,
    pub received_offline: u64,
}

impl StatsSnapshot {
    /// Messages that left this node on any tier
    pub fn sent(&self) -> u64 {
        self.sent_direct + self.sent_ice + self.queued_offline
    }

    /// Messages handed to the application
    pub fn received(&self) -> u64 {
        self.received_tcp + self.received_ice + self.received_offline
    }
}

impl TransportStats {
    pub(crate) fn record_direct(&self) {
        self.sent_direct.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ice(&self) {
        self.sent_ice.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queued(&self) {
        self.queued_offline.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, via: DeliveryPath) {
        let counter = match via {
            DeliveryPath::Tcp => &self.received_tcp,
            DeliveryPath::Ice => &self.received_ice,
            DeliveryPath::Offline => &self.received_offline,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent_direct: self.sent_direct.load(Ordering::Relaxed),
            sent_ice: self.sent_ice.load(Ordering::Relaxed),
            queued_offline: self.queued_offline.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            received_tcp: self.received_tcp.load(Ordering::Relaxed),
            received_ice: self.received_ice.load(Ordering::Relaxed),
            received_offline: self.received_offline.load(Ordering::Relaxed),
        }
    }
}
