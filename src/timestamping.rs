//! Kernel timestamping and socket option plumbing.
//!
//! Event-class PTP traffic needs precise egress and ingress timestamps.
//! On Linux both come from `SO_TIMESTAMPING`: RX timestamps arrive as
//! ancillary data on the normal receive path, TX timestamps loop back on
//! the socket error queue after the packet leaves the host (or the NIC,
//! with hardware timestamping).
//!
//! The worker owning a send socket is its only writer, so an error-queue
//! read always belongs to the most recent Sync sent on that socket. The
//! kernel send counter (`SOF_TIMESTAMPING_OPT_ID`) is still captured and
//! returned for observability.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags, SockaddrStorage,
    TimestampingFlag,
};
use nix::sys::time::TimeSpec;

/// Which clock stamps packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampType {
    /// NIC hardware clock (PHC); requires driver support.
    Hardware,
    /// Kernel software timestamps.
    #[default]
    Software,
}

impl std::fmt::Display for TimestampType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hardware => write!(f, "hardware"),
            Self::Software => write!(f, "software"),
        }
    }
}

/// Errors from the timestamping facility.
#[derive(Debug, thiserror::Error)]
pub enum TimestampError {
    /// No TX timestamp appeared on the error queue within the deadline.
    #[error("tx timestamp unavailable within {0:?}")]
    TxTimestampUnavailable(Duration),
    /// Underlying socket error.
    #[error("socket error: {0}")]
    Sys(#[from] Errno),
    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<TimestampError> for io::Error {
    fn from(err: TimestampError) -> Self {
        match err {
            TimestampError::Io(io_err) => io_err,
            TimestampError::Sys(errno) => io::Error::from_raw_os_error(errno as i32),
            other => io::Error::other(other),
        }
    }
}

/// An egress timestamp read from the socket error queue.
#[derive(Debug, Clone, Copy)]
pub struct TxTimestamp {
    /// When the packet left the host.
    pub time: SystemTime,
    /// Kernel send counter for the timestamped packet, when reported.
    pub send_counter: Option<u32>,
}

/// Enable TX+RX timestamping on a socket for the given clock source.
///
/// Software mode works on any Linux; hardware mode additionally needs a
/// NIC/driver that timestamps at the MAC (check `ethtool -T`).
///
/// # Errors
/// Fails if the kernel rejects the `SO_TIMESTAMPING` flags, e.g. when
/// hardware timestamping is requested on an interface without support.
pub fn enable_timestamping(fd: RawFd, ty: TimestampType) -> Result<(), TimestampError> {
    let mut flags = TimestampingFlag::SOF_TIMESTAMPING_OPT_ID
        | TimestampingFlag::SOF_TIMESTAMPING_OPT_TSONLY;
    flags |= match ty {
        TimestampType::Software => {
            TimestampingFlag::SOF_TIMESTAMPING_SOFTWARE
                | TimestampingFlag::SOF_TIMESTAMPING_TX_SOFTWARE
                | TimestampingFlag::SOF_TIMESTAMPING_RX_SOFTWARE
        }
        TimestampType::Hardware => {
            TimestampingFlag::SOF_TIMESTAMPING_RAW_HARDWARE
                | TimestampingFlag::SOF_TIMESTAMPING_TX_HARDWARE
                | TimestampingFlag::SOF_TIMESTAMPING_RX_HARDWARE
        }
    };
    // SAFETY: the borrow lives only for the setsockopt call; the caller
    // keeps the socket open for the duration.
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    setsockopt(&borrowed, sockopt::Timestamping, &flags)?;
    Ok(())
}

/// Apply a DSCP value to a send socket.
///
/// The DSCP occupies the upper six bits of the DS field, so the value is
/// shifted into place (`dscp << 2`). Uses `IP_TOS` for IPv4 sockets and
/// `IPV6_TCLASS` for IPv6.
///
/// # Errors
/// Fails if the socket rejects the option for the address family.
pub fn enable_dscp(fd: RawFd, ip: IpAddr, dscp: u8) -> Result<(), TimestampError> {
    let value = libc::c_int::from(dscp) << 2;
    let (level, option) = match ip {
        IpAddr::V4(_) => (libc::IPPROTO_IP, libc::IP_TOS),
        IpAddr::V6(_) => (libc::IPPROTO_IPV6, libc::IPV6_TCLASS),
    };
    #[allow(
        clippy::cast_possible_truncation,
        reason = "size_of::<c_int>() fits in socklen_t"
    )]
    let optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: fd is a live socket descriptor and value is a c_int of the
    // exact size passed as optlen.
    let rc = unsafe {
        libc::setsockopt(fd, level, option, std::ptr::addr_of!(value).cast(), optlen)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

#[allow(
    clippy::cast_sign_loss,
    reason = "Kernel timestamps are after the epoch"
)]
fn timespec_to_system_time(ts: TimeSpec) -> Option<SystemTime> {
    if ts.tv_sec() == 0 && ts.tv_nsec() == 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::new(ts.tv_sec() as u64, ts.tv_nsec() as u32))
}

/// Pick the stamp matching the configured type, falling back to the
/// other source when the preferred one is absent.
fn select_timestamp(
    ty: TimestampType,
    system: TimeSpec,
    hw_raw: TimeSpec,
) -> Option<SystemTime> {
    match ty {
        TimestampType::Hardware => {
            timespec_to_system_time(hw_raw).or_else(|| timespec_to_system_time(system))
        }
        TimestampType::Software => {
            timespec_to_system_time(system).or_else(|| timespec_to_system_time(hw_raw))
        }
    }
}

/// One nonblocking poll of the socket error queue for a TX timestamp.
///
/// Returns `Ok(None)` when nothing usable is queued yet.
///
/// # Errors
/// Propagates `recvmsg` failures other than `EAGAIN`/`EINTR`.
pub fn try_read_tx_timestamp(
    fd: RawFd,
    ty: TimestampType,
) -> Result<Option<TxTimestamp>, TimestampError> {
    // OPT_TSONLY strips the payload; a small buffer is still required
    // for the control messages to land.
    let mut data = [0u8; 64];
    let mut iov = [io::IoSliceMut::new(&mut data)];
    let mut cmsg_buf = nix::cmsg_space!([TimeSpec; 3], libc::sock_extended_err, libc::sockaddr_in6);

    let msg = match recvmsg::<SockaddrStorage>(
        fd,
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_ERRQUEUE | MsgFlags::MSG_DONTWAIT,
    ) {
        Ok(msg) => msg,
        Err(Errno::EAGAIN | Errno::EINTR) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut time = None;
    let mut send_counter = None;
    for cmsg in msg.cmsgs()? {
        match cmsg {
            ControlMessageOwned::ScmTimestampsns(stamps) => {
                time = select_timestamp(ty, stamps.system, stamps.hw_raw);
            }
            ControlMessageOwned::Ipv4RecvErr(err, _)
            | ControlMessageOwned::Ipv6RecvErr(err, _) => {
                if err.ee_origin == libc::SO_EE_ORIGIN_TIMESTAMPING {
                    send_counter = Some(err.ee_data);
                }
            }
            _ => {}
        }
    }

    Ok(time.map(|time| TxTimestamp { time, send_counter }))
}

/// Read the egress timestamp of the last packet sent on `fd`.
///
/// Polls the error queue until a report arrives or `deadline` elapses.
/// The caller must be the socket's only writer for the pairing to be
/// unambiguous.
///
/// # Errors
/// [`TimestampError::TxTimestampUnavailable`] when nothing arrives within
/// `deadline`; otherwise the underlying socket error.
pub async fn read_tx_timestamp(
    fd: RawFd,
    ty: TimestampType,
    deadline: Duration,
) -> Result<TxTimestamp, TimestampError> {
    const POLL_INTERVAL: Duration = Duration::from_micros(200);
    let started = Instant::now();
    loop {
        if let Some(ts) = try_read_tx_timestamp(fd, ty)? {
            return Ok(ts);
        }
        if started.elapsed() >= deadline {
            return Err(TimestampError::TxTimestampUnavailable(deadline));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// A packet received together with its ingress timestamp.
#[derive(Debug)]
pub struct TimestampedPacket {
    /// Number of payload bytes read into the caller's buffer.
    pub len: usize,
    /// Source address of the packet.
    pub source: SocketAddr,
    /// Ingress timestamp; kernel-provided when available, otherwise the
    /// system time observed at the read.
    pub rx_time: SystemTime,
}

/// One nonblocking receive with RX timestamp extraction.
///
/// Intended to be driven through `tokio::net::UdpSocket::try_io` after a
/// readiness notification; returns a `WouldBlock` I/O error when the
/// socket has nothing queued so readiness is re-armed correctly.
///
/// # Errors
/// Propagates `recvmsg` failures as `io::Error`.
pub fn recv_with_rx_timestamp(
    fd: RawFd,
    ty: TimestampType,
    buf: &mut [u8],
) -> io::Result<TimestampedPacket> {
    let mut iov = [io::IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!([TimeSpec; 3]);

    let msg = recvmsg::<SockaddrStorage>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::MSG_DONTWAIT)
        .map_err(io::Error::from)?;

    let source = msg
        .address
        .as_ref()
        .and_then(sockaddr_to_std)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no source address"))?;

    let mut rx_time = None;
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmTimestampsns(stamps) = cmsg {
            rx_time = select_timestamp(ty, stamps.system, stamps.hw_raw);
        }
    }

    Ok(TimestampedPacket {
        len: msg.bytes,
        source,
        rx_time: rx_time.unwrap_or_else(SystemTime::now),
    })
}

fn sockaddr_to_std(addr: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin) = addr.as_sockaddr_in() {
        return Some(SocketAddr::from((sin.ip(), sin.port())));
    }
    if let Some(sin6) = addr.as_sockaddr_in6() {
        return Some(SocketAddr::from((sin6.ip(), sin6.port())));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn software_timestamping_enables_on_any_socket() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        enable_timestamping(socket.as_raw_fd(), TimestampType::Software).unwrap();
    }

    #[tokio::test]
    async fn tx_timestamp_surfaces_after_loopback_send() {
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        enable_timestamping(sender.as_raw_fd(), TimestampType::Software).unwrap();

        let before = SystemTime::now();
        sender
            .send_to(b"tick", receiver.local_addr().unwrap())
            .unwrap();

        let tx = read_tx_timestamp(
            sender.as_raw_fd(),
            TimestampType::Software,
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        let after = SystemTime::now();
        assert!(tx.time >= before - Duration::from_secs(1));
        assert!(tx.time <= after + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn tx_timestamp_read_times_out_without_a_send() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        enable_timestamping(socket.as_raw_fd(), TimestampType::Software).unwrap();

        let result = read_tx_timestamp(
            socket.as_raw_fd(),
            TimestampType::Software,
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(
            result,
            Err(TimestampError::TxTimestampUnavailable(_))
        ));
    }

    #[test]
    fn rx_timestamp_arrives_with_packet() {
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_nonblocking(true).unwrap();
        enable_timestamping(receiver.as_raw_fd(), TimestampType::Software).unwrap();

        sender
            .send_to(b"ping", receiver.local_addr().unwrap())
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let mut buf = [0u8; 64];
        let packet =
            recv_with_rx_timestamp(receiver.as_raw_fd(), TimestampType::Software, &mut buf)
                .unwrap();
        assert_eq!(packet.len, 4);
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(packet.source, sender.local_addr().unwrap());
        let age = SystemTime::now()
            .duration_since(packet.rx_time)
            .unwrap_or(Duration::ZERO);
        assert!(age < Duration::from_secs(2));
    }
}
