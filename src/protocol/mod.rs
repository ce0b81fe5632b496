//! IEEE 1588-2008 wire protocol.
//!
//! The unicast server speaks plain PTP v2 over UDP:
//!
//! - **319** (event): Sync out, `Delay_Req` in, both timestamped.
//! - **320** (general): Announce, `Follow_Up`, `Delay_Resp`, Signaling.
//!
//! ## Unicast negotiation
//!
//! ```text
//! Client                                Server
//!   |-- Signaling / REQUEST_UNICAST ------>|  (clamp interval/duration)
//!   |<- Signaling / GRANT_UNICAST ---------|  (duration 0 = deny)
//!   |                                      |
//!   |<------- Announce / Sync ------------ |  (per granted cadence)
//!   |<------- Follow_Up (precise T1) ----- |
//!   |-- Delay_Req ----------------------->|
//!   |<- Delay_Resp (captured RX time) ----|
//! ```

pub mod message;
pub mod signaling;
pub mod timestamp;


pub use message::{
    ClockIdentity, ClockQuality, PortIdentity, PtpHeader, PtpMessage, PtpMessageBody,
    PtpMessageType, PtpParseError, FLAG_PTP_TIMESCALE, FLAG_TWO_STEP, FLAG_UNICAST,
};
pub use signaling::{
    CancelUnicastTransmission, GrantUnicastTransmission, RequestUnicastTransmission,
    SignalingMessage, SignalingTlv,
};
pub use timestamp::{duration_to_log_interval, log_interval_to_duration, PtpTimestamp};
