//! The unicast PTP server engine.
//!
//! A [`Server`] is a supervisor over three kinds of tasks:
//!
//! - **listeners** on the event port (319) and general port (320), one
//!   receive loop per configured `recv_workers` via `SO_REUSEPORT`;
//! - **send workers**, each owning a shard of subscriptions and a
//!   dedicated pair of send sockets;
//! - **subscription emitters**, one lightweight timer task per granted
//!   (client, message type) pair.
//!
//! Clients negotiate with `REQUEST_UNICAST_TRANSMISSION` TLVs; the
//! signaling handler clamps the requested cadence and duration against
//! dynamic config and registers the subscription on the worker selected
//! by hashing the client's port identity. Draining the server cancels
//! all emitters and answers new requests with zero-duration grants while
//! the sockets stay bound; undraining installs a fresh context.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, SystemTime};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};

use crate::config::{shared_dynamic, DynamicConfig, SharedDynamicConfig, StaticConfig};
use crate::error::ServerError;
use crate::protocol::{
    log_interval_to_duration, duration_to_log_interval, GrantUnicastTransmission, PortIdentity,
    PtpHeader, PtpMessage, PtpMessageBody, PtpMessageType, PtpTimestamp, SignalingMessage,
    SignalingTlv,
};
use crate::stats::StatsSink;
use crate::timestamping::{enable_timestamping, recv_with_rx_timestamp};

pub mod subscription;
pub mod worker;

#[cfg(test)]
mod tests;

pub use subscription::{DelayRespPayload, SubscriptionClient};
pub use worker::SendWorker;

/// Everything the server and its workers need to build messages.
pub struct ServerConfig {
    /// Process-lifetime configuration.
    pub static_config: StaticConfig,
    /// Identity of this server's clock.
    pub clock_identity: crate::protocol::ClockIdentity,
    /// Reloadable configuration, swapped on SIGHUP.
    pub dynamic: SharedDynamicConfig,
}

impl ServerConfig {
    /// Build a config with an explicit clock identity.
    #[must_use]
    pub fn new(static_config: StaticConfig, clock_identity: crate::protocol::ClockIdentity) -> Self {
        Self {
            static_config,
            clock_identity,
            dynamic: shared_dynamic(DynamicConfig::default()),
        }
    }

    /// Build a config, deriving the clock identity from the configured
    /// interface's MAC address.
    ///
    /// # Errors
    /// Fails when the interface has no usable MAC.
    pub fn from_interface(static_config: StaticConfig) -> Result<Self, ServerError> {
        let clock_identity =
            crate::config::clock_identity_from_interface(&static_config.interface)?;
        Ok(Self::new(static_config, clock_identity))
    }

    /// The port identity this server stamps into outgoing messages.
    #[must_use]
    pub fn server_port_identity(&self) -> PortIdentity {
        PortIdentity::new(self.clock_identity, 1)
    }

    /// Snapshot of the dynamic config (read lock held for the copy only).
    #[must_use]
    pub fn dynamic(&self) -> DynamicConfig {
        self.dynamic
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Outcome of clamping a unicast request against dynamic config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedGrant {
    /// Granted emission interval, at least `min_sub_interval`.
    pub interval: Duration,
    /// The interval as the log2 value echoed in the grant TLV.
    pub granted_log: i8,
    /// Granted lifetime, at most `max_sub_duration`.
    pub duration: Duration,
    /// The lifetime as the whole-second field of the grant TLV.
    pub duration_secs: u32,
}

/// Clamp a requested cadence and duration to the configured bounds:
/// the interval is raised to `min_sub_interval` and the duration capped
/// at `max_sub_duration`.
#[must_use]
pub fn negotiate_grant(
    log_inter_message_period: i8,
    duration_field: u32,
    dynamic: &DynamicConfig,
) -> NegotiatedGrant {
    let requested_interval = log_interval_to_duration(log_inter_message_period);
    let interval = requested_interval.max(dynamic.min_sub_interval);
    let duration =
        Duration::from_secs(u64::from(duration_field)).min(dynamic.max_sub_duration);
    NegotiatedGrant {
        interval,
        granted_log: duration_to_log_interval(interval),
        duration,
        duration_secs: u32::try_from(duration.as_secs()).unwrap_or(u32::MAX),
    }
}

/// Route a client to its worker: FNV-1a-64 over the 10 encoded identity
/// bytes, modulo the pool size. Stable across calls, so a client's whole
/// subscription set shares one worker.
#[must_use]
pub fn worker_index(port_identity: &PortIdentity, worker_count: usize) -> usize {
    const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in port_identity.encode() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Remainder is below worker_count, which is a usize"
    )]
    let index = (hash % worker_count.max(1) as u64) as usize;
    index
}

/// The unicast PTP server supervisor.
pub struct Server {
    config: Arc<ServerConfig>,
    stats: Arc<dyn StatsSink>,
    workers: Vec<Arc<SendWorker>>,
    /// Emitter/admission context. Replaced wholesale on undrain.
    drain: Mutex<watch::Sender<bool>>,
    /// Process-lifetime shutdown (SIGTERM or fatal error).
    shutdown: watch::Sender<bool>,
    bound_event: OnceLock<SocketAddr>,
    bound_general: OnceLock<SocketAddr>,
}

impl Server {
    /// Create a server with its worker pool. Nothing binds or spawns
    /// until [`Server::run`].
    #[must_use]
    pub fn new(config: ServerConfig, stats: Arc<dyn StatsSink>) -> Self {
        let config = Arc::new(config);
        let workers = (0..config.static_config.send_workers.max(1))
            .map(|id| Arc::new(SendWorker::new(id, Arc::clone(&config), Arc::clone(&stats))))
            .collect();
        let (drain, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            stats,
            workers,
            drain: Mutex::new(drain),
            shutdown,
            bound_event: OnceLock::new(),
            bound_general: OnceLock::new(),
        }
    }

    /// Shared configuration handle.
    #[must_use]
    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// The worker owning a client's subscriptions.
    #[must_use]
    pub fn find_worker(&self, port_identity: &PortIdentity) -> &Arc<SendWorker> {
        &self.workers[worker_index(port_identity, self.workers.len())]
    }

    /// Whether the server is currently drained.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        *self.drain_sender().borrow()
    }

    /// Stop emitting and deny new grants while staying bound.
    ///
    /// Every emitter observes the cancellation at its next tick.
    /// Idempotent.
    pub fn drain(&self) {
        tracing::warn!("draining server");
        let _ = self.drain_sender().send(true);
    }

    /// Leave the drained state: installs a fresh emitter context.
    /// Traffic resumes as clients renew their grants.
    pub fn undrain(&self) {
        tracing::warn!("undraining server");
        let (fresh, _) = watch::channel(false);
        *self.drain.lock().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    /// Subscribe to the current drain context. Emitters started now
    /// belong to this context and die with it.
    #[must_use]
    pub fn drain_receiver(&self) -> watch::Receiver<bool> {
        self.drain_sender().subscribe()
    }

    /// Event listener address after [`Server::run`] has bound it.
    /// Useful when the configured port is 0 (tests).
    #[must_use]
    pub fn bound_event_addr(&self) -> Option<SocketAddr> {
        self.bound_event.get().copied()
    }

    /// General listener address after [`Server::run`] has bound it.
    #[must_use]
    pub fn bound_general_addr(&self) -> Option<SocketAddr> {
        self.bound_general.get().copied()
    }

    /// Run the server: PID file, workers, listeners, signal handlers.
    /// Blocks until SIGTERM (clean) or a fatal socket error.
    ///
    /// # Errors
    /// Bind or socket-option failures at startup, and any fatal listener
    /// or worker error while running.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let static_config = &self.config.static_config;
        tracing::info!(
            "starting unicast PTP server on {} (identity {}, {} send workers, {} timestamps)",
            static_config.ip,
            self.config.clock_identity,
            self.workers.len(),
            static_config.timestamp_type,
        );

        static_config.create_pid_file()?;

        // Bind everything before spawning anything: a bad address or port
        // must fail the whole startup, not a background task.
        let event_addr = SocketAddr::new(static_config.ip, static_config.event_port);
        let general_addr = SocketAddr::new(static_config.ip, static_config.general_port);
        let mut event_sockets = Vec::with_capacity(static_config.recv_workers.max(1));
        let mut general_sockets = Vec::with_capacity(static_config.recv_workers.max(1));
        for _ in 0..static_config.recv_workers.max(1) {
            let event = bind_udp_reuseport(event_addr)?;
            enable_timestamping(event.as_raw_fd(), static_config.timestamp_type)?;
            event_sockets.push(event);
            general_sockets.push(bind_udp_reuseport(general_addr)?);
        }
        if let Some(first) = event_sockets.first() {
            let _ = self.bound_event.set(first.local_addr()?);
        }
        if let Some(first) = general_sockets.first() {
            let _ = self.bound_general.set(first.local_addr()?);
        }

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ServerError>(1);

        for worker in &self.workers {
            let task = Arc::clone(worker).run(self.shutdown.subscribe());
            spawn_fatal(task, fatal_tx.clone());
        }
        for event_socket in event_sockets {
            let task = Arc::clone(&self).event_listener(event_socket);
            spawn_fatal(task, fatal_tx.clone());
        }
        for general_socket in general_sockets {
            let task = Arc::clone(&self).general_listener(general_socket);
            spawn_fatal(task, fatal_tx.clone());
        }

        {
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = server.handle_sighup().await {
                    tracing::warn!("sighup handler failed: {err}");
                }
            });
        }
        tokio::spawn(Arc::clone(&self).stats_reporter());
        tokio::spawn(Arc::clone(&self).drain_watcher());

        tokio::select! {
            result = self.handle_sigterm() => {
                result?;
                Ok(())
            }
            Some(err) = fatal_rx.recv() => {
                tracing::error!("fatal error, shutting down: {err}");
                let _ = self.shutdown.send(true);
                let _ = self.config.static_config.delete_pid_file();
                Err(err)
            }
        }
    }

    /// Wait for SIGTERM, then remove the PID file and broadcast process
    /// shutdown.
    ///
    /// # Errors
    /// Fails only if the signal handler cannot be installed.
    pub async fn handle_sigterm(&self) -> io::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        sigterm.recv().await;
        tracing::info!("received SIGTERM, shutting down");
        if let Err(err) = self.config.static_config.delete_pid_file() {
            tracing::warn!("failed to remove pid file: {err}");
        }
        let _ = self.shutdown.send(true);
        Ok(())
    }

    /// Reload dynamic config on every SIGHUP. A failed reload keeps the
    /// previous configuration.
    ///
    /// # Errors
    /// Fails only if the signal handler cannot be installed.
    pub async fn handle_sighup(&self) -> io::Result<()> {
        let mut sighup = signal(SignalKind::hangup())?;
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                received = sighup.recv() => {
                    if received.is_none() {
                        return Ok(());
                    }
                    let path = &self.config.static_config.config_file;
                    match DynamicConfig::read_from(path) {
                        Ok(fresh) => {
                            *self
                                .config
                                .dynamic
                                .write()
                                .unwrap_or_else(PoisonError::into_inner) = fresh;
                            tracing::info!("dynamic config reloaded from {}", path.display());
                        }
                        Err(err) => {
                            tracing::warn!("config reload failed, keeping previous: {err}");
                        }
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn stats_reporter(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let interval = self.config.dynamic().metric_interval;
            tokio::select! {
                () = tokio::time::sleep(interval) => self.stats.report(),
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Poll the drain marker file: present means drained. Inert unless
    /// `drain_file` is configured.
    async fn drain_watcher(self: Arc<Self>) {
        let Some(path) = self.config.static_config.drain_file.clone() else {
            return;
        };
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let interval = self.config.dynamic().drain_interval;
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => return,
            }
            let exists = path.exists();
            if exists && !self.is_drained() {
                tracing::warn!("drain file {} present", path.display());
                self.drain();
            } else if !exists && self.is_drained() {
                tracing::warn!("drain file {} removed", path.display());
                self.undrain();
            }
        }
    }

    /// Event-port receive loop: `Delay_Req` in, with RX timestamps.
    async fn event_listener(self: Arc<Self>, socket: UdpSocket) -> io::Result<()> {
        let fd = socket.as_raw_fd();
        let timestamp_type = self.config.static_config.timestamp_type;
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; 512];
        tracing::info!("event listener on {}", socket.local_addr()?);

        loop {
            tokio::select! {
                ready = socket.readable() => {
                    ready?;
                    match socket.try_io(Interest::READABLE, || {
                        recv_with_rx_timestamp(fd, timestamp_type, &mut buf)
                    }) {
                        Ok(packet) => {
                            self.handle_event_packet(&buf[..packet.len], packet.source, packet.rx_time);
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                        Err(err) if is_transient_recv_error(&err) => {
                            tracing::debug!("event listener: transient error: {err}");
                        }
                        Err(err) => return Err(err),
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    fn handle_event_packet(&self, data: &[u8], source: SocketAddr, rx_time: SystemTime) {
        match PtpMessage::decode(data) {
            Ok(message) => {
                self.stats.inc_rx(message.header.message_type);
                if let PtpMessageBody::DelayReq { .. } = message.body {
                    self.handle_delay_req(&message.header, rx_time);
                } else {
                    tracing::debug!(
                        "event listener: ignoring {} from {}",
                        message.header.message_type,
                        source
                    );
                }
            }
            Err(err) => {
                self.stats.inc_rx_malformed();
                tracing::debug!("event listener: malformed packet from {}: {}", source, err);
            }
        }
    }

    /// Answer a `Delay_Req` through the client's worker: the response
    /// carries the captured RX timestamp shifted to TAI and echoes the
    /// request's sequence id and correction field.
    fn handle_delay_req(&self, header: &PtpHeader, rx_time: SystemTime) {
        if self.is_drained() {
            return;
        }
        let client = header.source_port_identity;
        let worker = self.find_worker(&client);
        let Some(sub) = worker.find_subscription(&client, PtpMessageType::DelayResp) else {
            tracing::debug!("no delay_resp subscription for {}", client);
            return;
        };
        let utc_offset = self.config.dynamic().utc_offset;
        sub.set_delay_resp(DelayRespPayload {
            sequence_id: header.sequence_id,
            correction_field: header.correction_field,
            receive_timestamp: PtpTimestamp::from_system_time(rx_time).add_duration(utc_offset),
            requesting_port: client,
        });
        sub.enqueue_once();
    }

    /// General-port receive loop: Signaling in.
    async fn general_listener(self: Arc<Self>, socket: UdpSocket) -> io::Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; 1024];
        tracing::info!("general listener on {}", socket.local_addr()?);

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, source)) => self.handle_general_packet(&buf[..len], source),
                        Err(err) if is_transient_recv_error(&err) => {
                            tracing::debug!("general listener: transient error: {err}");
                        }
                        Err(err) => return Err(err),
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    fn handle_general_packet(&self, data: &[u8], source: SocketAddr) {
        match PtpHeader::decode(data) {
            Ok(header) if header.message_type == PtpMessageType::Signaling => {
                match SignalingMessage::decode(data) {
                    Ok(message) => {
                        self.stats.inc_rx(PtpMessageType::Signaling);
                        self.handle_signaling(&message, source);
                    }
                    Err(err) => {
                        self.stats.inc_rx_malformed();
                        tracing::debug!(
                            "general listener: bad signaling from {}: {}",
                            source,
                            err
                        );
                    }
                }
            }
            Ok(header) => {
                tracing::debug!(
                    "general listener: ignoring {} from {}",
                    header.message_type,
                    source
                );
            }
            Err(err) => {
                self.stats.inc_rx_malformed();
                tracing::debug!("general listener: malformed packet from {}: {}", source, err);
            }
        }
    }

    /// Process every negotiation TLV in an inbound Signaling message.
    pub fn handle_signaling(&self, message: &SignalingMessage, source: SocketAddr) {
        for tlv in &message.tlvs {
            match tlv {
                SignalingTlv::Request(request) => {
                    self.handle_request(&message.header, *request, source);
                }
                SignalingTlv::Cancel(cancel) => {
                    self.handle_cancel(&message.header, cancel.msg_nibble, source);
                }
                SignalingTlv::Grant(_)
                | SignalingTlv::AcknowledgeCancel(_)
                | SignalingTlv::Other { .. } => {
                    tracing::debug!("ignoring signaling TLV {:?} from {}", tlv, source);
                }
            }
        }
    }

    fn handle_request(
        &self,
        header: &PtpHeader,
        request: crate::protocol::RequestUnicastTransmission,
        source: SocketAddr,
    ) {
        let client = header.source_port_identity;
        let worker = self.find_worker(&client);
        let dynamic = self.config.dynamic();

        let NegotiatedGrant {
            interval,
            granted_log,
            duration,
            duration_secs,
        } = negotiate_grant(
            request.log_inter_message_period,
            request.duration_field,
            &dynamic,
        );

        let supported = matches!(
            request.message_type(),
            Ok(PtpMessageType::Announce | PtpMessageType::Sync | PtpMessageType::DelayResp)
        );
        if !supported {
            tracing::debug!(
                "denying unsupported request type 0x{:X} from {}",
                request.msg_nibble,
                client
            );
            self.stats.inc_denials();
            self.send_signaling_reply(
                worker,
                client,
                source,
                header.sequence_id,
                SignalingTlv::Grant(GrantUnicastTransmission {
                    msg_nibble: request.msg_nibble,
                    log_inter_message_period: granted_log,
                    duration_field: 0,
                    renewal_invited: false,
                }),
            );
            return;
        }
        if self.is_drained() {
            tracing::debug!("drained: denying request from {}", client);
            self.stats.inc_denials();
            self.send_signaling_reply(
                worker,
                client,
                source,
                header.sequence_id,
                SignalingTlv::Grant(GrantUnicastTransmission {
                    msg_nibble: request.msg_nibble,
                    log_inter_message_period: granted_log,
                    duration_field: 0,
                    renewal_invited: false,
                }),
            );
            return;
        }

        // Unwrap is safe under `supported` above, but stay total anyway.
        let Ok(msg_type) = request.message_type() else {
            return;
        };
        let static_config = &self.config.static_config;
        let event_addr = SocketAddr::new(source.ip(), static_config.event_port);
        let general_addr = SocketAddr::new(source.ip(), static_config.general_port);
        let expire = SystemTime::now() + duration;

        let sub = worker.find_or_register(client, msg_type, || {
            Arc::new(SubscriptionClient::new(
                worker.queue(),
                event_addr,
                general_addr,
                msg_type,
                client,
                Arc::clone(&self.stats),
                interval,
                expire,
            ))
        });
        sub.set_interval(interval);
        sub.set_expire(expire);
        if sub.claim_running() {
            tracing::info!(
                "granting {} to {} every {:?} for {:?}",
                msg_type,
                client,
                interval,
                duration
            );
            tokio::spawn(Arc::clone(&sub).run(self.drain_receiver()));
        } else {
            tracing::debug!(
                "refreshed {} grant for {} every {:?} for {:?}",
                msg_type,
                client,
                interval,
                duration
            );
        }

        self.stats.inc_grants();
        self.send_signaling_reply(
            worker,
            client,
            source,
            header.sequence_id,
            SignalingTlv::Grant(GrantUnicastTransmission {
                msg_nibble: request.msg_nibble,
                log_inter_message_period: granted_log,
                duration_field: duration_secs,
                renewal_invited: true,
            }),
        );
    }

    fn handle_cancel(&self, header: &PtpHeader, msg_nibble: u8, source: SocketAddr) {
        let client = header.source_port_identity;
        let worker = self.find_worker(&client);
        if let Ok(msg_type) = PtpMessageType::from_nibble(msg_nibble) {
            if let Some(sub) = worker.find_subscription(&client, msg_type) {
                tracing::info!("cancelling {} subscription for {}", msg_type, client);
                sub.stop();
            }
        }
        self.send_signaling_reply(
            worker,
            client,
            source,
            header.sequence_id,
            SignalingTlv::AcknowledgeCancel(crate::protocol::CancelUnicastTransmission {
                msg_nibble,
            }),
        );
    }

    /// Emit a Signaling reply (grant or cancel-ack) through the client's
    /// worker so the worker stays the only writer on its sockets.
    pub fn send_signaling_reply(
        &self,
        worker: &Arc<SendWorker>,
        client: PortIdentity,
        destination: SocketAddr,
        sequence_id: u16,
        tlv: SignalingTlv,
    ) {
        let reply = SignalingMessage::new(
            self.config.server_port_identity(),
            client,
            sequence_id,
            vec![tlv],
        );
        let one_shot = Arc::new(SubscriptionClient::new(
            worker.queue(),
            destination,
            destination,
            PtpMessageType::Signaling,
            client,
            Arc::clone(&self.stats),
            Duration::ZERO,
            SystemTime::now(),
        ));
        one_shot.set_signaling_payload(reply.encode());
        one_shot.enqueue_once();
    }

    fn drain_sender(&self) -> std::sync::MutexGuard<'_, watch::Sender<bool>> {
        self.drain.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn spawn_fatal<F>(task: F, fatal_tx: mpsc::Sender<ServerError>)
where
    F: std::future::Future<Output = io::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = task.await {
            let _ = fatal_tx.send(err.into()).await;
        }
    });
}

/// Bind a nonblocking UDP socket with `SO_REUSEPORT` so several receive
/// loops can share one port.
fn bind_udp_reuseport(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Receive errors that should not kill a listener loop.
fn is_transient_recv_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionReset
    )
}
