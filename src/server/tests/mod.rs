use std::net::IpAddr;
use std::sync::Arc;

use crate::config::StaticConfig;
use crate::protocol::{ClockIdentity, PortIdentity};
use crate::server::ServerConfig;
use crate::stats::AtomicStats;

mod server;
mod worker;

fn test_server_config(send_workers: usize) -> Arc<ServerConfig> {
    Arc::new(ServerConfig::new(
        StaticConfig {
            ip: IpAddr::from([127, 0, 0, 1]),
            send_workers,
            recv_workers: 1,
            queue_size: 100,
            dscp: 0,
            event_port: 0,
            general_port: 0,
            ..Default::default()
        },
        ClockIdentity(1234),
    ))
}

fn test_stats() -> Arc<AtomicStats> {
    Arc::new(AtomicStats::new())
}

fn client_port(clock: u64, port: u16) -> PortIdentity {
    PortIdentity::new(ClockIdentity(clock), port)
}
