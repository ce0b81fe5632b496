//! Send workers.
//!
//! Each worker owns a shard of subscriptions (chosen by hashing the
//! client's port identity), a bounded work queue, and a dedicated pair of
//! send sockets. Serializing every send through the worker's single loop
//! gives the TX-timestamp pipeline its correctness: the error-queue read
//! after a Sync can only belong to that Sync, because nothing else writes
//! on the event socket.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::protocol::{
    duration_to_log_interval, ClockQuality, PortIdentity, PtpMessage, PtpMessageType,
    PtpTimestamp,
};
use crate::stats::StatsSink;
use crate::timestamping::{enable_dscp, enable_timestamping, read_tx_timestamp};

use super::subscription::{SubscriptionClient, WorkQueue};
use super::ServerConfig;

type Inventory = HashMap<PtpMessageType, HashMap<PortIdentity, Arc<SubscriptionClient>>>;

/// A send worker: one shard of subscriptions, one send loop, two sockets.
pub struct SendWorker {
    id: usize,
    config: Arc<ServerConfig>,
    stats: Arc<dyn StatsSink>,
    queue_tx: WorkQueue,
    queue_rx: Mutex<Option<mpsc::Receiver<Arc<SubscriptionClient>>>>,
    clients: Mutex<Inventory>,
}

struct WorkerSockets {
    event: UdpSocket,
    general: UdpSocket,
    event_fd: RawFd,
}

impl SendWorker {
    /// Create a worker. Sockets are opened when [`SendWorker::run`]
    /// starts, so construction cannot fail.
    #[must_use]
    pub fn new(id: usize, config: Arc<ServerConfig>, stats: Arc<dyn StatsSink>) -> Self {
        let capacity = config.static_config.queue_size.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(capacity);
        Self {
            id,
            config,
            stats,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Worker index within the pool.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Handle for subscriptions to enqueue themselves.
    #[must_use]
    pub fn queue(&self) -> WorkQueue {
        self.queue_tx.clone()
    }

    /// Insert a subscription into the inventory, replacing any previous
    /// entry for the same (client, type).
    pub fn register_subscription(
        &self,
        port_identity: PortIdentity,
        msg_type: PtpMessageType,
        subscription: Arc<SubscriptionClient>,
    ) {
        self.inventory()
            .entry(msg_type)
            .or_default()
            .insert(port_identity, subscription);
    }

    /// Look up the live subscription for (client, type).
    #[must_use]
    pub fn find_subscription(
        &self,
        port_identity: &PortIdentity,
        msg_type: PtpMessageType,
    ) -> Option<Arc<SubscriptionClient>> {
        self.inventory()
            .get(&msg_type)
            .and_then(|subs| subs.get(port_identity))
            .cloned()
    }

    /// Atomically fetch the subscription for (client, type), creating and
    /// registering it when absent. Concurrent listeners negotiating the
    /// same client converge on one instance.
    pub fn find_or_register(
        &self,
        port_identity: PortIdentity,
        msg_type: PtpMessageType,
        make: impl FnOnce() -> Arc<SubscriptionClient>,
    ) -> Arc<SubscriptionClient> {
        self.inventory()
            .entry(msg_type)
            .or_default()
            .entry(port_identity)
            .or_insert_with(make)
            .clone()
    }

    /// Number of inventoried subscriptions for a message type.
    #[must_use]
    pub fn subscription_count(&self, msg_type: PtpMessageType) -> usize {
        self.inventory()
            .get(&msg_type)
            .map_or(0, HashMap::len)
    }

    /// Sweep the inventory: drop subscriptions that stopped running or
    /// whose grant expired, then publish per-type gauges.
    pub fn inventory_clients(&self) {
        let now = SystemTime::now();
        let mut inventory = self.inventory();
        for (msg_type, subs) in inventory.iter_mut() {
            subs.retain(|port, sub| {
                let keep = sub.is_running() && sub.expire() > now;
                if !keep {
                    tracing::debug!(
                        "worker {}: dropping {} subscription for {}",
                        self.id,
                        msg_type,
                        port
                    );
                }
                keep
            });
            self.stats
                .set_subscriptions(self.id, *msg_type, subs.len());
        }
    }

    /// Run the worker: open sockets, then serve the queue until process
    /// shutdown. On shutdown the queue is drained without sending.
    ///
    /// # Errors
    /// Socket setup failures are fatal for the server.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let sockets = self.open_sockets().await?;
        tracing::info!(
            "worker {}: ready (event {}, general {})",
            self.id,
            sockets.event.local_addr()?,
            sockets.general.local_addr()?
        );

        let Some(mut queue_rx) = self.take_queue_rx() else {
            tracing::warn!("worker {}: already running", self.id);
            return Ok(());
        };

        // The sweep deadline is re-derived from dynamic config after
        // every sweep, so a SIGHUP that changes `metricinterval` takes
        // effect on the next cycle without restarting the worker.
        let mut next_sweep =
            tokio::time::Instant::now() + self.config.dynamic().metric_interval;

        loop {
            tokio::select! {
                item = queue_rx.recv() => match item {
                    Some(subscription) => self.process(&sockets, &subscription).await,
                    None => break,
                },
                () = tokio::time::sleep_until(next_sweep) => {
                    self.inventory_clients();
                    next_sweep =
                        tokio::time::Instant::now() + self.config.dynamic().metric_interval;
                }
                _ = shutdown.changed() => {
                    while queue_rx.try_recv().is_ok() {}
                    break;
                }
            }
        }

        tracing::info!("worker {}: stopped", self.id);
        Ok(())
    }

    async fn open_sockets(&self) -> io::Result<WorkerSockets> {
        let static_config = &self.config.static_config;
        let bind_addr = SocketAddr::new(static_config.ip, 0);
        let event = UdpSocket::bind(bind_addr).await?;
        let general = UdpSocket::bind(bind_addr).await?;
        let event_fd = event.as_raw_fd();

        enable_dscp(event_fd, static_config.ip, static_config.dscp).map_err(io::Error::from)?;
        enable_dscp(general.as_raw_fd(), static_config.ip, static_config.dscp)
            .map_err(io::Error::from)?;
        enable_timestamping(event_fd, static_config.timestamp_type).map_err(io::Error::from)?;

        Ok(WorkerSockets {
            event,
            general,
            event_fd,
        })
    }

    async fn process(&self, sockets: &WorkerSockets, subscription: &Arc<SubscriptionClient>) {
        match subscription.msg_type() {
            PtpMessageType::Announce => self.send_announce(sockets, subscription).await,
            PtpMessageType::Sync => self.send_sync(sockets, subscription).await,
            PtpMessageType::DelayResp => self.send_delay_resp(sockets, subscription).await,
            PtpMessageType::Signaling => self.send_signaling(sockets, subscription).await,
            other => {
                tracing::debug!("worker {}: ignoring queue item of type {}", self.id, other);
            }
        }
    }

    async fn send_announce(&self, sockets: &WorkerSockets, sub: &Arc<SubscriptionClient>) {
        let sequence_id = sub.next_sequence_id();
        let (utc_offset_secs, quality) = {
            let dynamic = self.config.dynamic();
            (
                dynamic.utc_offset_secs(),
                ClockQuality {
                    clock_class: dynamic.clock_class,
                    clock_accuracy: dynamic.clock_accuracy,
                    offset_scaled_log_variance: 0xFFFF,
                },
            )
        };
        let message = PtpMessage::announce(
            self.config.server_port_identity(),
            sequence_id,
            duration_to_log_interval(sub.interval()),
            utc_offset_secs,
            quality,
        );
        self.send(
            &sockets.general,
            &message.encode(),
            sub.general_addr(),
            sub,
            PtpMessageType::Announce,
        )
        .await;
    }

    async fn send_sync(&self, sockets: &WorkerSockets, sub: &Arc<SubscriptionClient>) {
        let sequence_id = sub.next_sequence_id();
        let log_interval = duration_to_log_interval(sub.interval());
        let source = self.config.server_port_identity();

        let sync = PtpMessage::sync(source, sequence_id, log_interval);
        let sent = self
            .send(
                &sockets.event,
                &sync.encode(),
                sub.event_addr(),
                sub,
                PtpMessageType::Sync,
            )
            .await;
        if !sent {
            return;
        }

        let static_config = &self.config.static_config;
        match read_tx_timestamp(
            sockets.event_fd,
            static_config.timestamp_type,
            static_config.tx_timestamp_timeout,
        )
        .await
        {
            Ok(tx) => {
                tracing::trace!(
                    "worker {}: sync {} egress at {:?} (kernel send counter {:?})",
                    self.id,
                    sequence_id,
                    tx.time,
                    tx.send_counter
                );
                let utc_offset = self.config.dynamic().utc_offset;
                let precise =
                    PtpTimestamp::from_system_time(tx.time).add_duration(utc_offset);
                let follow_up =
                    PtpMessage::follow_up(source, sequence_id, log_interval, precise);
                self.send(
                    &sockets.general,
                    &follow_up.encode(),
                    sub.general_addr(),
                    sub,
                    PtpMessageType::FollowUp,
                )
                .await;
            }
            Err(err) => {
                self.stats.inc_tx_ts_missing();
                tracing::warn!(
                    "worker {}: no tx timestamp for sync {} to {}: {}",
                    self.id,
                    sequence_id,
                    sub.port_identity(),
                    err
                );
            }
        }
    }

    async fn send_delay_resp(&self, sockets: &WorkerSockets, sub: &Arc<SubscriptionClient>) {
        let Some(payload) = sub.take_delay_resp() else {
            return;
        };
        let message = PtpMessage::delay_resp(
            self.config.server_port_identity(),
            payload.sequence_id,
            payload.correction_field,
            payload.receive_timestamp,
            payload.requesting_port,
        );
        self.send(
            &sockets.general,
            &message.encode(),
            sub.general_addr(),
            sub,
            PtpMessageType::DelayResp,
        )
        .await;
    }

    async fn send_signaling(&self, sockets: &WorkerSockets, sub: &Arc<SubscriptionClient>) {
        let Some(encoded) = sub.take_signaling_payload() else {
            return;
        };
        self.send(
            &sockets.general,
            &encoded,
            sub.general_addr(),
            sub,
            PtpMessageType::Signaling,
        )
        .await;
    }

    /// Send with a single retry on transient errors. Persistent failures
    /// mark the subscription degraded and drop the tick.
    async fn send(
        &self,
        socket: &UdpSocket,
        data: &[u8],
        addr: SocketAddr,
        sub: &Arc<SubscriptionClient>,
        msg_type: PtpMessageType,
    ) -> bool {
        let mut result = socket.send_to(data, addr).await;
        if let Err(ref err) = result {
            if is_transient_send_error(err) {
                result = socket.send_to(data, addr).await;
            }
        }
        match result {
            Ok(_) => {
                sub.set_degraded(false);
                self.stats.inc_tx(msg_type);
                true
            }
            Err(err) => {
                self.stats.inc_send_errors();
                sub.set_degraded(true);
                tracing::warn!(
                    "worker {}: failed to send {} to {}: {}",
                    self.id,
                    msg_type,
                    addr,
                    err
                );
                false
            }
        }
    }

    fn take_queue_rx(&self) -> Option<mpsc::Receiver<Arc<SubscriptionClient>>> {
        self.queue_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn inventory(&self) -> std::sync::MutexGuard<'_, Inventory> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Errors worth one immediate retry before giving up on a tick.
fn is_transient_send_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}
