//! # ptpserve
//!
//! A unicast PTP (IEEE 1588-2008) time server.
//!
//! Clients negotiate Announce/Sync/`Delay_Resp` streams over Signaling
//! messages; the server fans the granted traffic out across a pool of
//! send workers, pairs every Sync with its kernel/NIC egress timestamp,
//! and answers `Delay_Req` with the captured receive timestamp.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ptpserve::config::StaticConfig;
//! use ptpserve::server::{Server, ServerConfig};
//! use ptpserve::stats::AtomicStats;
//!
//! # async fn example() -> Result<(), ptpserve::ServerError> {
//! let config = ServerConfig::from_interface(StaticConfig {
//!     ip: "10.0.0.1".parse().expect("valid address"),
//!     interface: "eth0".to_string(),
//!     config_file: "/etc/ptpserve.yaml".into(),
//!     ..Default::default()
//! })?;
//!
//! let server = Arc::new(Server::new(config, Arc::new(AtomicStats::new())));
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Configuration (static and SIGHUP-reloadable)
pub mod config;
/// Error types
pub mod error;
/// IEEE 1588 wire protocol
pub mod protocol;
/// Server engine: supervisor, listeners, workers, subscriptions
pub mod server;
/// Stats sink
pub mod stats;
/// Kernel timestamping and socket options
pub mod timestamping;

// Re-exports
pub use config::{DynamicConfig, StaticConfig};
pub use error::ServerError;
pub use server::{Server, ServerConfig};
pub use stats::{AtomicStats, StatsSink};
pub use timestamping::TimestampType;
