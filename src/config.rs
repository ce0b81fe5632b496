//! Server configuration.
//!
//! Configuration is split the way the process treats it: [`StaticConfig`]
//! is fixed for the process lifetime (sockets, worker counts, paths),
//! while [`DynamicConfig`] is re-read from a YAML file on SIGHUP and
//! swapped atomically under a single lock. Message builders take a read
//! lock per build, so a reload is visible from the next emission onward.
//!
//! Dynamic file format (durations are Go-style strings):
//!
//! ```yaml
//! clockaccuracy: 33
//! clockclass: 6
//! draininterval: "30s"
//! maxsubduration: "1h"
//! metricinterval: "1m"
//! minsubinterval: "1s"
//! utcoffset: "37s"
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::ClockIdentity;
use crate::timestamping::TimestampType;

/// Errors from configuration loading and process setup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Config file could not be parsed.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Path that failed.
        path: PathBuf,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },
    /// A duration string was not understood.
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
    /// A parsed value failed validation.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Offending config key.
        field: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// The configured interface has no usable MAC address.
    #[error("no MAC address on interface {0:?}")]
    NoMacAddress(String),
    /// Interface enumeration failed.
    #[error("failed to enumerate interfaces: {0}")]
    Interfaces(#[from] nix::errno::Errno),
}

/// Process-lifetime configuration.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    /// Local IP the listeners bind and workers send from.
    pub ip: IpAddr,
    /// Interface whose MAC seeds the clock identity.
    pub interface: String,
    /// Timestamp source for event traffic.
    pub timestamp_type: TimestampType,
    /// Number of send workers; each owns a shard of subscriptions.
    pub send_workers: usize,
    /// Receive loops per listening port (`SO_REUSEPORT`).
    pub recv_workers: usize,
    /// Capacity of each worker's send queue.
    pub queue_size: usize,
    /// DSCP applied to all send sockets.
    pub dscp: u8,
    /// PID file path; created at startup, removed on SIGTERM.
    pub pid_file: PathBuf,
    /// Dynamic config path, re-read on SIGHUP.
    pub config_file: PathBuf,
    /// Optional drain marker: while this file exists the server drains.
    pub drain_file: Option<PathBuf>,
    /// UDP port for event messages (standard: 319).
    pub event_port: u16,
    /// UDP port for general messages (standard: 320).
    pub general_port: u16,
    /// Deadline for error-queue TX timestamp reads.
    pub tx_timestamp_timeout: Duration,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::from([0, 0, 0, 0]),
            interface: "eth0".to_string(),
            timestamp_type: TimestampType::Software,
            send_workers: 10,
            recv_workers: 10,
            queue_size: 10_000,
            dscp: 35,
            pid_file: PathBuf::from("/var/run/ptpserve.pid"),
            config_file: PathBuf::new(),
            drain_file: None,
            event_port: 319,
            general_port: 320,
            tx_timestamp_timeout: Duration::from_millis(10),
        }
    }
}

impl StaticConfig {
    /// Write the PID file with this process id.
    ///
    /// # Errors
    /// Propagates the underlying filesystem error.
    pub fn create_pid_file(&self) -> std::io::Result<()> {
        std::fs::write(&self.pid_file, std::process::id().to_string())
    }

    /// Remove the PID file.
    ///
    /// # Errors
    /// Propagates the underlying filesystem error.
    pub fn delete_pid_file(&self) -> std::io::Result<()> {
        std::fs::remove_file(&self.pid_file)
    }
}

/// Reloadable configuration, swapped under one lock on SIGHUP.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DynamicConfig {
    /// PTP `clockAccuracy` advertised in Announce.
    #[serde(rename = "clockaccuracy")]
    pub clock_accuracy: u8,
    /// PTP `clockClass` advertised in Announce.
    #[serde(rename = "clockclass")]
    pub clock_class: u8,
    /// Poll cadence for the drain marker file.
    #[serde(rename = "draininterval", deserialize_with = "de_duration")]
    pub drain_interval: Duration,
    /// Upper bound on granted subscription duration.
    #[serde(rename = "maxsubduration", deserialize_with = "de_duration")]
    pub max_sub_duration: Duration,
    /// Stats reporting and inventory sweep cadence.
    #[serde(rename = "metricinterval", deserialize_with = "de_duration")]
    pub metric_interval: Duration,
    /// Lower bound on granted message intervals.
    #[serde(rename = "minsubinterval", deserialize_with = "de_duration")]
    pub min_sub_interval: Duration,
    /// TAI-UTC offset added to emitted timestamps.
    #[serde(rename = "utcoffset", deserialize_with = "de_duration")]
    pub utc_offset: Duration,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            clock_accuracy: 0xFE, // unknown
            clock_class: 248,     // default per IEEE 1588 Table 5
            drain_interval: Duration::from_secs(30),
            max_sub_duration: Duration::from_secs(3600),
            metric_interval: Duration::from_secs(60),
            min_sub_interval: Duration::from_secs(1),
            utc_offset: Duration::from_secs(37),
        }
    }
}

impl DynamicConfig {
    /// Load and validate dynamic configuration from a YAML file.
    ///
    /// # Errors
    /// Read, parse, or validation failures; callers keep the previous
    /// config on error.
    pub fn read_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_sub_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "minsubinterval",
                reason: "must be positive",
            });
        }
        if self.max_sub_duration.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "maxsubduration",
                reason: "must be positive",
            });
        }
        if self.metric_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "metricinterval",
                reason: "must be positive",
            });
        }
        Ok(())
    }

    /// TAI-UTC offset as the signed 16-bit seconds field of Announce.
    #[must_use]
    pub fn utc_offset_secs(&self) -> i16 {
        i16::try_from(self.utc_offset.as_secs()).unwrap_or(i16::MAX)
    }
}

/// Dynamic config handle shared across workers, listeners, and signal
/// tasks. Readers hold the lock only for the duration of a message build.
pub type SharedDynamicConfig = Arc<RwLock<DynamicConfig>>;

/// Wrap a [`DynamicConfig`] for sharing.
#[must_use]
pub fn shared_dynamic(config: DynamicConfig) -> SharedDynamicConfig {
    Arc::new(RwLock::new(config))
}

/// Parse a Go-style duration string: a sequence of `<number><unit>`
/// segments, e.g. `"2s"`, `"1m30s"`, `"125ms"`, `"1.5h"`.
///
/// Units: `ns`, `us`, `ms`, `s`, `m`, `h`.
///
/// # Errors
/// [`ConfigError::InvalidDuration`] on malformed input.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(invalid)?; // bare number with no unit
        if num_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        let unit_rest = &rest[num_len..];
        let unit_len = unit_rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(unit_rest.len());
        let scale = match &unit_rest[..unit_len] {
            "ns" => 1e-9,
            "us" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        total += Duration::try_from_secs_f64(value * scale).map_err(|_| invalid())?;
        rest = &unit_rest[unit_len..];
    }
    Ok(total)
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Derive the server clock identity from an interface's MAC address.
///
/// # Errors
/// [`ConfigError::NoMacAddress`] when the interface does not exist or
/// carries no link-layer address.
pub fn clock_identity_from_interface(name: &str) -> Result<ClockIdentity, ConfigError> {
    for ifaddr in nix::ifaddrs::getifaddrs()? {
        if ifaddr.interface_name != name {
            continue;
        }
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(mac) = storage.as_link_addr().and_then(nix::sys::socket::LinkAddr::addr) {
            if mac != [0u8; 6] {
                return Ok(ClockIdentity::from_mac(mac));
            }
        }
    }
    Err(ConfigError::NoMacAddress(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_simple_durations() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("4m").unwrap(), Duration::from_secs(240));
        assert_eq!(parse_duration("3h").unwrap(), Duration::from_secs(10_800));
        assert_eq!(parse_duration("125ms").unwrap(), Duration::from_millis(125));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_duration("50ns").unwrap(), Duration::from_nanos(50));
    }

    #[test]
    fn parse_compound_and_fractional_durations() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(
            parse_duration("1h2m3s").unwrap(),
            Duration::from_secs(3723)
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", "s", "10", "10x", "-5s", "1s2"] {
            assert!(parse_duration(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn dynamic_config_loads_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "clockaccuracy: 0\nclockclass: 1\ndraininterval: \"2s\"\n\
             maxsubduration: \"3h\"\nmetricinterval: \"4m\"\n\
             minsubinterval: \"5s\"\nutcoffset: \"37s\"\n"
        )
        .unwrap();

        let config = DynamicConfig::read_from(file.path()).unwrap();
        assert_eq!(config.clock_accuracy, 0);
        assert_eq!(config.clock_class, 1);
        assert_eq!(config.drain_interval, Duration::from_secs(2));
        assert_eq!(config.max_sub_duration, Duration::from_secs(3 * 3600));
        assert_eq!(config.metric_interval, Duration::from_secs(4 * 60));
        assert_eq!(config.min_sub_interval, Duration::from_secs(5));
        assert_eq!(config.utc_offset, Duration::from_secs(37));
        assert_eq!(config.utc_offset_secs(), 37);
    }

    #[test]
    fn dynamic_config_rejects_zero_intervals() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "clockaccuracy: 0\nclockclass: 1\ndraininterval: \"2s\"\n\
             maxsubduration: \"3h\"\nmetricinterval: \"4m\"\n\
             minsubinterval: \"0s\"\nutcoffset: \"37s\"\n"
        )
        .unwrap();
        assert!(DynamicConfig::read_from(file.path()).is_err());
    }

    #[test]
    fn dynamic_config_rejects_malformed_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "clockaccuracy: [not a number\n").unwrap();
        assert!(DynamicConfig::read_from(file.path()).is_err());
    }

    #[test]
    fn pid_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = StaticConfig {
            pid_file: dir.path().join("ptpserve.pid"),
            ..Default::default()
        };
        config.create_pid_file().unwrap();
        let content = std::fs::read_to_string(&config.pid_file).unwrap();
        assert_eq!(content, std::process::id().to_string());
        config.delete_pid_file().unwrap();
        assert!(!config.pid_file.exists());
    }
}
