//! Counters and gauges surfaced by all components.
//!
//! The server takes its stats sink as a trait object so embedders can
//! route counters into their own telemetry. [`AtomicStats`] is the
//! default implementation: lock-free counters plus a snapshot used by the
//! periodic reporter and by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::PtpMessageType;

/// Stats sink implemented by telemetry backends.
///
/// Implementations must be internally synchronized; every component holds
/// the same shared reference.
pub trait StatsSink: Send + Sync + 'static {
    /// A packet of the given type was received and parsed.
    fn inc_rx(&self, msg_type: PtpMessageType);
    /// A message of the given type was sent.
    fn inc_tx(&self, msg_type: PtpMessageType);
    /// An inbound packet failed to parse.
    fn inc_rx_malformed(&self);
    /// A unicast request was granted.
    fn inc_grants(&self);
    /// A unicast request was denied (zero-duration grant).
    fn inc_denials(&self);
    /// A send failed after retry.
    fn inc_send_errors(&self);
    /// A subscription tick was dropped because the worker queue was full.
    fn inc_queue_full(&self);
    /// A Sync went out but its egress timestamp never surfaced.
    fn inc_tx_ts_missing(&self);
    /// Per-worker, per-type live subscription gauge.
    fn set_subscriptions(&self, worker_id: usize, msg_type: PtpMessageType, count: usize);
    /// Periodic summary hook, driven at `metric_interval` cadence.
    fn report(&self) {}
}

const MSG_TYPE_SLOTS: usize = 6;

fn slot(msg_type: PtpMessageType) -> usize {
    match msg_type {
        PtpMessageType::Sync => 0,
        PtpMessageType::DelayReq => 1,
        PtpMessageType::FollowUp => 2,
        PtpMessageType::DelayResp => 3,
        PtpMessageType::Announce => 4,
        PtpMessageType::Signaling => 5,
    }
}

/// Atomic in-process stats sink.
#[derive(Default)]
pub struct AtomicStats {
    rx: [AtomicU64; MSG_TYPE_SLOTS],
    tx: [AtomicU64; MSG_TYPE_SLOTS],
    rx_malformed: AtomicU64,
    grants: AtomicU64,
    denials: AtomicU64,
    send_errors: AtomicU64,
    queue_full: AtomicU64,
    tx_ts_missing: AtomicU64,
    subscriptions: std::sync::Mutex<HashMap<(usize, u8), usize>>,
}

impl AtomicStats {
    /// Create a zeroed sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let subscriptions = self
            .subscriptions
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default();
        StatsSnapshot {
            rx: self.rx.iter().map(|c| c.load(Ordering::Relaxed)).collect(),
            tx: self.tx.iter().map(|c| c.load(Ordering::Relaxed)).collect(),
            rx_malformed: self.rx_malformed.load(Ordering::Relaxed),
            grants: self.grants.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            tx_ts_missing: self.tx_ts_missing.load(Ordering::Relaxed),
            subscriptions,
        }
    }

}

impl StatsSink for AtomicStats {
    fn inc_rx(&self, msg_type: PtpMessageType) {
        self.rx[slot(msg_type)].fetch_add(1, Ordering::Relaxed);
    }

    fn inc_tx(&self, msg_type: PtpMessageType) {
        self.tx[slot(msg_type)].fetch_add(1, Ordering::Relaxed);
    }

    fn inc_rx_malformed(&self) {
        self.rx_malformed.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_grants(&self) {
        self.grants.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_denials(&self) {
        self.denials.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_send_errors(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_tx_ts_missing(&self) {
        self.tx_ts_missing.fetch_add(1, Ordering::Relaxed);
    }

    fn set_subscriptions(&self, worker_id: usize, msg_type: PtpMessageType, count: usize) {
        if let Ok(mut map) = self.subscriptions.lock() {
            map.insert((worker_id, msg_type as u8), count);
        }
    }

    /// Log a one-line summary of the current counters.
    fn report(&self) {
        let snap = self.snapshot();
        let total_subs: usize = snap.subscriptions.values().sum();
        tracing::info!(
            tx_sync = snap.tx_for(PtpMessageType::Sync),
            tx_follow_up = snap.tx_for(PtpMessageType::FollowUp),
            tx_announce = snap.tx_for(PtpMessageType::Announce),
            tx_delay_resp = snap.tx_for(PtpMessageType::DelayResp),
            rx_delay_req = snap.rx_for(PtpMessageType::DelayReq),
            rx_signaling = snap.rx_for(PtpMessageType::Signaling),
            rx_malformed = snap.rx_malformed,
            grants = snap.grants,
            denials = snap.denials,
            send_errors = snap.send_errors,
            queue_full = snap.queue_full,
            tx_ts_missing = snap.tx_ts_missing,
            subscriptions = total_subs,
            "stats"
        );
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    rx: Vec<u64>,
    tx: Vec<u64>,
    /// Packets dropped for parse failures.
    pub rx_malformed: u64,
    /// Granted unicast requests.
    pub grants: u64,
    /// Denied unicast requests.
    pub denials: u64,
    /// Sends that failed after retry.
    pub send_errors: u64,
    /// Ticks dropped on a full worker queue.
    pub queue_full: u64,
    /// Syncs whose egress timestamp never surfaced.
    pub tx_ts_missing: u64,
    /// Live subscription counts keyed by (worker id, message type).
    pub subscriptions: HashMap<(usize, u8), usize>,
}

impl StatsSnapshot {
    /// Received-count for a message type.
    #[must_use]
    pub fn rx_for(&self, msg_type: PtpMessageType) -> u64 {
        self.rx[slot(msg_type)]
    }

    /// Sent-count for a message type.
    #[must_use]
    pub fn tx_for(&self, msg_type: PtpMessageType) -> u64 {
        self.tx[slot(msg_type)]
    }

    /// Total live subscriptions of a type across all workers.
    #[must_use]
    pub fn subscriptions_for(&self, msg_type: PtpMessageType) -> usize {
        self.subscriptions
            .iter()
            .filter(|((_, ty), _)| *ty == msg_type as u8)
            .map(|(_, count)| *count)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = AtomicStats::new();
        stats.inc_tx(PtpMessageType::Sync);
        stats.inc_tx(PtpMessageType::Sync);
        stats.inc_tx(PtpMessageType::Announce);
        stats.inc_rx(PtpMessageType::DelayReq);
        stats.inc_queue_full();
        stats.inc_tx_ts_missing();

        let snap = stats.snapshot();
        assert_eq!(snap.tx_for(PtpMessageType::Sync), 2);
        assert_eq!(snap.tx_for(PtpMessageType::Announce), 1);
        assert_eq!(snap.rx_for(PtpMessageType::DelayReq), 1);
        assert_eq!(snap.queue_full, 1);
        assert_eq!(snap.tx_ts_missing, 1);
        assert_eq!(snap.send_errors, 0);
    }

    #[test]
    fn subscription_gauges_aggregate_across_workers() {
        let stats = AtomicStats::new();
        stats.set_subscriptions(0, PtpMessageType::Sync, 2);
        stats.set_subscriptions(1, PtpMessageType::Sync, 3);
        stats.set_subscriptions(0, PtpMessageType::Announce, 1);
        // Overwrites, not accumulates.
        stats.set_subscriptions(1, PtpMessageType::Sync, 1);

        let snap = stats.snapshot();
        assert_eq!(snap.subscriptions_for(PtpMessageType::Sync), 3);
        assert_eq!(snap.subscriptions_for(PtpMessageType::Announce), 1);
        assert_eq!(snap.subscriptions_for(PtpMessageType::DelayResp), 0);
    }

    #[test]
    fn all_types_have_distinct_slots() {
        let all = [
            PtpMessageType::Sync,
            PtpMessageType::DelayReq,
            PtpMessageType::FollowUp,
            PtpMessageType::DelayResp,
            PtpMessageType::Announce,
            PtpMessageType::Signaling,
        ];
        let mut seen = std::collections::HashSet::new();
        for ty in all {
            assert!(seen.insert(slot(ty)));
        }
    }
}
