//! Per-client subscription state and its periodic emitter.
//!
//! A subscription exists per (client port identity, message type) and is
//! owned by exactly one send worker. The emitter task never touches the
//! socket: on each tick it enqueues the subscription onto its worker's
//! queue and the worker performs the send. A full queue drops the tick,
//! so cadence is preserved instead of building back-pressure skew.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};

use crate::protocol::{PortIdentity, PtpMessageType, PtpTimestamp};
use crate::stats::StatsSink;

/// Handle on a worker's send queue.
pub type WorkQueue = mpsc::Sender<Arc<SubscriptionClient>>;

/// One-shot `Delay_Resp` content prepared by the `Delay_Req` path.
#[derive(Debug, Clone, Copy)]
pub struct DelayRespPayload {
    /// Sequence id echoed from the request.
    pub sequence_id: u16,
    /// Correction field echoed from the request.
    pub correction_field: i64,
    /// Captured RX timestamp, already shifted to TAI.
    pub receive_timestamp: PtpTimestamp,
    /// Port identity of the requesting client.
    pub requesting_port: PortIdentity,
}

struct SubscriptionState {
    interval: Duration,
    expire: SystemTime,
    sequence_id: u16,
}

/// A unicast subscription: identity, destinations, cadence, expiry.
pub struct SubscriptionClient {
    msg_type: PtpMessageType,
    port_identity: PortIdentity,
    event_addr: SocketAddr,
    general_addr: SocketAddr,
    queue: WorkQueue,
    stats: Arc<dyn StatsSink>,
    running: AtomicBool,
    degraded: AtomicBool,
    state: Mutex<SubscriptionState>,
    delay_resp: Mutex<Option<DelayRespPayload>>,
    signaling_payload: Mutex<Option<Vec<u8>>>,
}

impl SubscriptionClient {
    /// Create a subscription bound to a worker queue.
    #[allow(clippy::too_many_arguments, reason = "Construction site is the handler only")]
    #[must_use]
    pub fn new(
        queue: WorkQueue,
        event_addr: SocketAddr,
        general_addr: SocketAddr,
        msg_type: PtpMessageType,
        port_identity: PortIdentity,
        stats: Arc<dyn StatsSink>,
        interval: Duration,
        expire: SystemTime,
    ) -> Self {
        Self {
            msg_type,
            port_identity,
            event_addr,
            general_addr,
            queue,
            stats,
            running: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            state: Mutex::new(SubscriptionState {
                interval,
                expire,
                sequence_id: 0,
            }),
            delay_resp: Mutex::new(None),
            signaling_payload: Mutex::new(None),
        }
    }

    /// Message type this subscription emits.
    #[must_use]
    pub fn msg_type(&self) -> PtpMessageType {
        self.msg_type
    }

    /// Client port identity.
    #[must_use]
    pub fn port_identity(&self) -> PortIdentity {
        self.port_identity
    }

    /// Destination for event-class messages.
    #[must_use]
    pub fn event_addr(&self) -> SocketAddr {
        self.event_addr
    }

    /// Destination for general-class messages.
    #[must_use]
    pub fn general_addr(&self) -> SocketAddr {
        self.general_addr
    }

    /// Current emission interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.state().interval
    }

    /// Update the emission interval (grant refresh).
    pub fn set_interval(&self, interval: Duration) {
        self.state().interval = interval;
    }

    /// Absolute expiry of the grant.
    #[must_use]
    pub fn expire(&self) -> SystemTime {
        self.state().expire
    }

    /// Update the expiry (grant refresh).
    pub fn set_expire(&self, expire: SystemTime) {
        self.state().expire = expire;
    }

    /// Whether the emitter loop is live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Atomically claim the running flag.
    ///
    /// Returns `true` when the caller performed the idle → running
    /// transition and therefore owns spawning the emitter. Concurrent
    /// refreshes for the same subscription race through here; only one
    /// spawns.
    pub fn claim_running(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Request the emitter to stop at its next tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Whether the last send attempt failed persistently.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Mark or clear the degraded state.
    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }

    /// Consume the next sequence id, wrapping at 2^16.
    pub fn next_sequence_id(&self) -> u16 {
        let mut state = self.state();
        let current = state.sequence_id;
        state.sequence_id = current.wrapping_add(1);
        current
    }

    /// Stash a `Delay_Resp` for the worker to send.
    pub fn set_delay_resp(&self, payload: DelayRespPayload) {
        *self.lock(&self.delay_resp) = Some(payload);
    }

    /// Take the pending `Delay_Resp`, if any.
    #[must_use]
    pub fn take_delay_resp(&self) -> Option<DelayRespPayload> {
        self.lock(&self.delay_resp).take()
    }

    /// Stash an encoded Signaling reply (grant or cancel-ack).
    pub fn set_signaling_payload(&self, encoded: Vec<u8>) {
        *self.lock(&self.signaling_payload) = Some(encoded);
    }

    /// Take the pending Signaling reply, if any.
    #[must_use]
    pub fn take_signaling_payload(&self) -> Option<Vec<u8>> {
        self.lock(&self.signaling_payload).take()
    }

    /// Enqueue this subscription on its worker once, without blocking.
    ///
    /// A full queue counts against `queue_full` and the tick is lost; a
    /// closed queue means the worker is gone and the tick is dropped
    /// silently.
    pub fn enqueue_once(self: &Arc<Self>) {
        match self.queue.try_send(Arc::clone(self)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.inc_queue_full();
                tracing::warn!(
                    "subscription {} {}: worker queue full, dropping tick",
                    self.port_identity,
                    self.msg_type
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Emitter loop: tick, self-enqueue, sleep, until expiry or cancel.
    ///
    /// The first emission happens immediately so a fresh grant produces
    /// traffic without waiting a full interval. `Delay_Resp`
    /// subscriptions skip self-enqueue entirely; their loop only tracks
    /// expiry so the inventory sweep observes `running` correctly.
    pub async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        {
            let mut state = self.state();
            state.sequence_id = 0;
        }
        self.running.store(true, Ordering::Release);
        tracing::debug!(
            "subscription {} {}: emitter started",
            self.port_identity,
            self.msg_type
        );

        loop {
            if !self.is_running() {
                break;
            }
            if SystemTime::now() >= self.expire() {
                tracing::debug!(
                    "subscription {} {}: grant expired",
                    self.port_identity,
                    self.msg_type
                );
                break;
            }

            if matches!(
                self.msg_type,
                PtpMessageType::Announce | PtpMessageType::Sync
            ) {
                self.enqueue_once();
            }

            let interval = self.interval();
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        tracing::debug!(
                            "subscription {} {}: cancelled",
                            self.port_identity,
                            self.msg_type
                        );
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::Release);
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SubscriptionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SubscriptionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionClient")
            .field("msg_type", &self.msg_type)
            .field("port_identity", &self.port_identity)
            .field("event_addr", &self.event_addr)
            .field("general_addr", &self.general_addr)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
