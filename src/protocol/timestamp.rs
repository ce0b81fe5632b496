//! PTP timestamp representation and message-interval math.
//!
//! IEEE 1588 carries time as 80-bit timestamps (48-bit seconds + 32-bit
//! nanoseconds) and message cadences as signed log2 seconds
//! (`logInterMessagePeriod`). This module provides both, plus conversions
//! from the system clock used when stamping outbound messages.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// IEEE 1588 PTP timestamp: 48-bit seconds + 32-bit nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PtpTimestamp {
    /// Seconds since the PTP epoch.
    pub seconds: u64,
    /// Nanoseconds within the current second (`0..999_999_999`).
    pub nanoseconds: u32,
}

impl PtpTimestamp {
    /// Nanoseconds per second.
    pub const NANOS_PER_SEC: u32 = 1_000_000_000;

    /// Maximum seconds representable in the 48-bit wire field.
    pub const MAX_SECONDS_48BIT: u64 = (1u64 << 48) - 1;

    /// Wire size of an encoded timestamp.
    pub const WIRE_SIZE: usize = 10;

    /// Zero timestamp (used as the origin of two-step Sync messages).
    pub const ZERO: Self = Self {
        seconds: 0,
        nanoseconds: 0,
    };

    /// Create a new timestamp, clamping nanoseconds to the valid range.
    #[must_use]
    pub fn new(seconds: u64, nanoseconds: u32) -> Self {
        Self {
            seconds,
            nanoseconds: nanoseconds.min(Self::NANOS_PER_SEC - 1),
        }
    }

    /// Current system time as a PTP timestamp.
    #[must_use]
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Convert a [`SystemTime`] into a PTP timestamp.
    ///
    /// Times before the Unix epoch collapse to zero.
    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        let dur = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Self {
            seconds: dur.as_secs(),
            nanoseconds: dur.subsec_nanos(),
        }
    }

    /// Add a [`Duration`], carrying nanosecond overflow into seconds.
    ///
    /// Used to shift UTC-referenced capture times by the configured
    /// TAI-UTC offset before they go on the wire.
    #[must_use]
    pub fn add_duration(&self, d: Duration) -> Self {
        let total_nanos = u64::from(self.nanoseconds) + u64::from(d.subsec_nanos());
        let carry = total_nanos / u64::from(Self::NANOS_PER_SEC);
        #[allow(
            clippy::cast_possible_truncation,
            reason = "Remainder below NANOS_PER_SEC always fits in u32"
        )]
        let nanoseconds = (total_nanos % u64::from(Self::NANOS_PER_SEC)) as u32;
        Self {
            seconds: self.seconds + d.as_secs() + carry,
            nanoseconds,
        }
    }

    /// Encode as IEEE 1588 wire format: 6-byte seconds (BE) + 4-byte
    /// nanoseconds (BE).
    #[must_use]
    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        let sec_bytes = (self.seconds & Self::MAX_SECONDS_48BIT).to_be_bytes();
        buf[0..6].copy_from_slice(&sec_bytes[2..8]);
        buf[6..10].copy_from_slice(&self.nanoseconds.to_be_bytes());
        buf
    }

    /// Decode from IEEE 1588 wire format.
    ///
    /// Returns `None` if the slice is shorter than [`Self::WIRE_SIZE`].
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WIRE_SIZE {
            return None;
        }
        let seconds =
            u64::from_be_bytes([0, 0, data[0], data[1], data[2], data[3], data[4], data[5]]);
        let nanoseconds = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);
        Some(Self {
            seconds,
            nanoseconds,
        })
    }
}

impl std::fmt::Display for PtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanoseconds)
    }
}

impl From<SystemTime> for PtpTimestamp {
    fn from(t: SystemTime) -> Self {
        Self::from_system_time(t)
    }
}

/// Convert a signed log2 message period into a concrete interval.
///
/// `log_interval = 0` is one second, `-3` is 125 ms, `4` is 16 s.
/// Values beyond what a [`Duration`] can hold saturate instead of
/// panicking; requests are clamped against config bounds afterwards
/// anyway.
#[must_use]
pub fn log_interval_to_duration(log_interval: i8) -> Duration {
    let secs = 2f64.powi(i32::from(log_interval));
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Convert an interval back into the nearest log2 message period.
///
/// Inverse of [`log_interval_to_duration`], used when a grant echoes a
/// clamped cadence back to the client. Sub-nanosecond intervals saturate
/// at the shortest representable period.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    reason = "Value is clamped to the i8 range before the cast"
)]
pub fn duration_to_log_interval(interval: Duration) -> i8 {
    let secs = interval.as_secs_f64();
    if secs <= 0.0 {
        return i8::MIN;
    }
    let log = secs.log2().round();
    log.clamp(f64::from(i8::MIN), f64::from(i8::MAX)) as i8
}
