//! PTP message types, parsing, and encoding.
//!
//! Implements the IEEE 1588-2008 message format as used by a unicast
//! server: the 34-byte common header, event messages (Sync, `Delay_Req`)
//! and general messages (`Follow_Up`, `Delay_Resp`, Announce). Signaling
//! and its TLVs live in [`super::signaling`].

use super::timestamp::PtpTimestamp;

/// PTP message type identifiers (IEEE 1588 Section 13.3.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PtpMessageType {
    /// Sync message (server → client), event class.
    Sync = 0x00,
    /// Delay request (client → server), event class.
    DelayReq = 0x01,
    /// Follow-up carrying the precise Sync origin timestamp.
    FollowUp = 0x08,
    /// Delay response carrying the `Delay_Req` receive timestamp.
    DelayResp = 0x09,
    /// Announce carrying grandmaster clock properties.
    Announce = 0x0B,
    /// Signaling carrying unicast negotiation TLVs.
    Signaling = 0x0C,
}

impl PtpMessageType {
    /// Parse from the lower 4 bits of the first header byte.
    pub fn from_nibble(value: u8) -> Result<Self, PtpParseError> {
        match value & 0x0F {
            0x00 => Ok(Self::Sync),
            0x01 => Ok(Self::DelayReq),
            0x08 => Ok(Self::FollowUp),
            0x09 => Ok(Self::DelayResp),
            0x0B => Ok(Self::Announce),
            0x0C => Ok(Self::Signaling),
            other => Err(PtpParseError::UnknownMessageType(other)),
        }
    }

    /// Whether this type is an event message (requires timestamping).
    #[must_use]
    pub fn is_event(&self) -> bool {
        matches!(self, Self::Sync | Self::DelayReq)
    }

    /// Whether this type is a general message.
    #[must_use]
    pub fn is_general(&self) -> bool {
        !self.is_event()
    }

    /// Control field value for this type (deprecated in v2, still sent).
    #[must_use]
    pub fn control_field(&self) -> u8 {
        match self {
            Self::Sync => 0x00,
            Self::DelayReq => 0x01,
            Self::FollowUp => 0x02,
            Self::DelayResp => 0x03,
            Self::Announce | Self::Signaling => 0x05,
        }
    }
}

impl std::fmt::Display for PtpMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => write!(f, "Sync"),
            Self::DelayReq => write!(f, "Delay_Req"),
            Self::FollowUp => write!(f, "Follow_Up"),
            Self::DelayResp => write!(f, "Delay_Resp"),
            Self::Announce => write!(f, "Announce"),
            Self::Signaling => write!(f, "Signaling"),
        }
    }
}

/// 8-byte PTP clock identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ClockIdentity(pub u64);

impl ClockIdentity {
    /// Derive a clock identity from a MAC address.
    ///
    /// EUI-48 → EUI-64 expansion: the two bytes `FF FE` are inserted
    /// between the OUI and the device bytes, matching what PTP daemons
    /// derive from the bound interface.
    #[must_use]
    pub fn from_mac(mac: [u8; 6]) -> Self {
        Self(u64::from_be_bytes([
            mac[0], mac[1], mac[2], 0xFF, 0xFE, mac[3], mac[4], mac[5],
        ]))
    }
}

impl std::fmt::Display for ClockIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}{:02x}{:02x}.{:02x}{:02x}.{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// PTP port identity: 8-byte clock identity + 2-byte port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PortIdentity {
    /// Clock identity of the endpoint.
    pub clock_identity: ClockIdentity,
    /// Port number (1-based).
    pub port_number: u16,
}

impl PortIdentity {
    /// Wire size of an encoded port identity.
    pub const WIRE_SIZE: usize = 10;

    /// Create a new port identity.
    #[must_use]
    pub fn new(clock_identity: ClockIdentity, port_number: u16) -> Self {
        Self {
            clock_identity,
            port_number,
        }
    }

    /// Encode as 10 bytes (8-byte clock identity + 2-byte port, BE).
    #[must_use]
    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.clock_identity.0.to_be_bytes());
        buf[8..10].copy_from_slice(&self.port_number.to_be_bytes());
        buf
    }

    /// Decode from 10 bytes.
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(Self {
            clock_identity: ClockIdentity(u64::from_be_bytes([
                data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
            ])),
            port_number: u16::from_be_bytes([data[8], data[9]]),
        })
    }
}

impl std::fmt::Display for PortIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.clock_identity, self.port_number)
    }
}

/// Flag field bit: message was sent to a unicast address.
pub const FLAG_UNICAST: u16 = 0x0400;
/// Flag field bit: two-step clock, a `Follow_Up` carries the precise T1.
pub const FLAG_TWO_STEP: u16 = 0x0200;
/// Flag field bit: the timescale of the grandmaster is PTP (TAI).
pub const FLAG_PTP_TIMESCALE: u16 = 0x0800;

/// Time source: GNSS-derived grandmaster (IEEE 1588 Table 7).
pub const TIME_SOURCE_GNSS: u8 = 0x20;

/// Full IEEE 1588 PTP message header (34 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtpHeader {
    /// Transport-specific nibble (upper 4 bits of byte 0).
    pub transport_specific: u8,
    /// Message type (lower 4 bits of byte 0).
    pub message_type: PtpMessageType,
    /// PTP version (2).
    pub version: u8,
    /// Total message length including header.
    pub message_length: u16,
    /// Domain number.
    pub domain_number: u8,
    /// Flags field.
    pub flags: u16,
    /// Correction field (nanoseconds * 2^16, signed).
    pub correction_field: i64,
    /// Source port identity.
    pub source_port_identity: PortIdentity,
    /// Sequence ID.
    pub sequence_id: u16,
    /// Control field.
    pub control_field: u8,
    /// Log message interval.
    pub log_message_interval: i8,
}

impl PtpHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 34;

    /// PTP version carried by this implementation.
    pub const PTP_VERSION_2: u8 = 2;

    /// `logMessageInterval` value for messages without a defined cadence.
    pub const LOG_INTERVAL_UNDEFINED: i8 = 0x7F;

    /// Create a header with defaults for the given type.
    #[must_use]
    pub fn new(message_type: PtpMessageType, source: PortIdentity, sequence_id: u16) -> Self {
        Self {
            transport_specific: 0,
            message_type,
            version: Self::PTP_VERSION_2,
            message_length: 0, // filled in on encode
            domain_number: 0,
            flags: FLAG_UNICAST,
            correction_field: 0,
            source_port_identity: source,
            sequence_id,
            control_field: message_type.control_field(),
            log_message_interval: Self::LOG_INTERVAL_UNDEFINED,
        }
    }

    /// Encode to 34 bytes, computing the total length from `body_length`.
    #[must_use]
    pub fn encode(&self, body_length: usize) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = (self.transport_specific << 4) | (self.message_type as u8 & 0x0F);
        buf[1] = self.version & 0x0F;
        #[allow(
            clippy::cast_possible_truncation,
            reason = "PTP messages are bounded far below u16::MAX"
        )]
        let total_len = (Self::SIZE + body_length) as u16;
        buf[2..4].copy_from_slice(&total_len.to_be_bytes());
        buf[4] = self.domain_number;
        // buf[5] reserved
        buf[6..8].copy_from_slice(&self.flags.to_be_bytes());
        buf[8..16].copy_from_slice(&self.correction_field.to_be_bytes());
        // buf[16..20] reserved
        buf[20..30].copy_from_slice(&self.source_port_identity.encode());
        buf[30..32].copy_from_slice(&self.sequence_id.to_be_bytes());
        buf[32] = self.control_field;
        buf[33] = self.log_message_interval as u8;
        buf
    }

    /// Decode from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PtpParseError> {
        if data.len() < Self::SIZE {
            return Err(PtpParseError::TooShort {
                needed: Self::SIZE,
                have: data.len(),
            });
        }
        let message_type = PtpMessageType::from_nibble(data[0])?;
        let source_port_identity =
            PortIdentity::decode(&data[20..30]).ok_or(PtpParseError::TooShort {
                needed: 30,
                have: data.len(),
            })?;
        Ok(Self {
            transport_specific: data[0] >> 4,
            message_type,
            version: data[1] & 0x0F,
            message_length: u16::from_be_bytes([data[2], data[3]]),
            domain_number: data[4],
            flags: u16::from_be_bytes([data[6], data[7]]),
            correction_field: i64::from_be_bytes([
                data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
            ]),
            source_port_identity,
            sequence_id: u16::from_be_bytes([data[30], data[31]]),
            control_field: data[32],
            log_message_interval: data[33] as i8,
        })
    }
}

/// Grandmaster clock quality (IEEE 1588 Section 5.3.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockQuality {
    /// `clockClass`: traceability of the time source.
    pub clock_class: u8,
    /// `clockAccuracy`: enumerated accuracy bound.
    pub clock_accuracy: u8,
    /// `offsetScaledLogVariance`: stability estimate (0xFFFF = unknown).
    pub offset_scaled_log_variance: u16,
}

/// A parsed PTP message with header and typed body.
#[derive(Debug, Clone)]
pub struct PtpMessage {
    /// Message header.
    pub header: PtpHeader,
    /// Message body.
    pub body: PtpMessageBody,
}

/// PTP message body variants.
#[derive(Debug, Clone)]
pub enum PtpMessageBody {
    /// Sync: origin timestamp (zero for two-step operation).
    Sync {
        /// Origin timestamp.
        origin_timestamp: PtpTimestamp,
    },
    /// Follow-up: precise origin timestamp of the matching Sync.
    FollowUp {
        /// Egress timestamp of the Sync with the same sequence id.
        precise_origin_timestamp: PtpTimestamp,
    },
    /// Delay request from a client.
    DelayReq {
        /// Origin timestamp (client send time).
        origin_timestamp: PtpTimestamp,
    },
    /// Delay response: when the server received the `Delay_Req`.
    DelayResp {
        /// Receive timestamp of the `Delay_Req`.
        receive_timestamp: PtpTimestamp,
        /// Port identity of the requesting client.
        requesting_port_identity: PortIdentity,
    },
    /// Announce: grandmaster clock properties.
    Announce {
        /// Origin timestamp (zero for this server).
        origin_timestamp: PtpTimestamp,
        /// Current TAI-UTC offset in seconds.
        current_utc_offset: i16,
        /// Grandmaster priority1.
        grandmaster_priority1: u8,
        /// Grandmaster clock quality.
        grandmaster_clock_quality: ClockQuality,
        /// Grandmaster priority2.
        grandmaster_priority2: u8,
        /// Grandmaster clock identity.
        grandmaster_identity: ClockIdentity,
        /// Number of boundary clocks between grandmaster and recipient.
        steps_removed: u16,
        /// Time source enumeration.
        time_source: u8,
    },
}

impl PtpMessage {
    /// Body size for Sync/FollowUp/DelayReq.
    const TIMESTAMP_BODY_SIZE: usize = PtpTimestamp::WIRE_SIZE;
    /// Body size for DelayResp.
    const DELAY_RESP_BODY_SIZE: usize = PtpTimestamp::WIRE_SIZE + PortIdentity::WIRE_SIZE;
    /// Body size for Announce.
    const ANNOUNCE_BODY_SIZE: usize = 30;

    /// Parse a complete PTP message from bytes.
    ///
    /// Signaling is handled by [`super::signaling::SignalingMessage`];
    /// passing a Signaling packet here yields
    /// [`PtpParseError::UnexpectedSignaling`].
    pub fn decode(data: &[u8]) -> Result<Self, PtpParseError> {
        let header = PtpHeader::decode(data)?;
        let body_data = &data[PtpHeader::SIZE..];

        let too_short = |needed: usize| PtpParseError::TooShort {
            needed: PtpHeader::SIZE + needed,
            have: data.len(),
        };

        let body = match header.message_type {
            PtpMessageType::Signaling => return Err(PtpParseError::UnexpectedSignaling),
            PtpMessageType::Sync => PtpMessageBody::Sync {
                origin_timestamp: PtpTimestamp::decode(body_data)
                    .ok_or_else(|| too_short(Self::TIMESTAMP_BODY_SIZE))?,
            },
            PtpMessageType::FollowUp => PtpMessageBody::FollowUp {
                precise_origin_timestamp: PtpTimestamp::decode(body_data)
                    .ok_or_else(|| too_short(Self::TIMESTAMP_BODY_SIZE))?,
            },
            PtpMessageType::DelayReq => PtpMessageBody::DelayReq {
                origin_timestamp: PtpTimestamp::decode(body_data)
                    .ok_or_else(|| too_short(Self::TIMESTAMP_BODY_SIZE))?,
            },
            PtpMessageType::DelayResp => {
                if body_data.len() < Self::DELAY_RESP_BODY_SIZE {
                    return Err(too_short(Self::DELAY_RESP_BODY_SIZE));
                }
                PtpMessageBody::DelayResp {
                    receive_timestamp: PtpTimestamp::decode(body_data)
                        .ok_or_else(|| too_short(Self::DELAY_RESP_BODY_SIZE))?,
                    requesting_port_identity: PortIdentity::decode(&body_data[10..20])
                        .ok_or_else(|| too_short(Self::DELAY_RESP_BODY_SIZE))?,
                }
            }
            PtpMessageType::Announce => {
                if body_data.len() < Self::ANNOUNCE_BODY_SIZE {
                    return Err(too_short(Self::ANNOUNCE_BODY_SIZE));
                }
                PtpMessageBody::Announce {
                    origin_timestamp: PtpTimestamp::decode(body_data)
                        .ok_or_else(|| too_short(Self::ANNOUNCE_BODY_SIZE))?,
                    current_utc_offset: i16::from_be_bytes([body_data[10], body_data[11]]),
                    // body_data[12] reserved
                    grandmaster_priority1: body_data[13],
                    grandmaster_clock_quality: ClockQuality {
                        clock_class: body_data[14],
                        clock_accuracy: body_data[15],
                        offset_scaled_log_variance: u16::from_be_bytes([
                            body_data[16],
                            body_data[17],
                        ]),
                    },
                    grandmaster_priority2: body_data[18],
                    grandmaster_identity: ClockIdentity(u64::from_be_bytes([
                        body_data[19],
                        body_data[20],
                        body_data[21],
                        body_data[22],
                        body_data[23],
                        body_data[24],
                        body_data[25],
                        body_data[26],
                    ])),
                    steps_removed: u16::from_be_bytes([body_data[27], body_data[28]]),
                    time_source: body_data[29],
                }
            }
        };

        Ok(Self { header, body })
    }

    /// Encode to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let body_bytes = self.encode_body();
        let header_bytes = self.header.encode(body_bytes.len());
        let mut buf = Vec::with_capacity(PtpHeader::SIZE + body_bytes.len());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&body_bytes);
        buf
    }

    fn encode_body(&self) -> Vec<u8> {
        match &self.body {
            PtpMessageBody::Sync { origin_timestamp }
            | PtpMessageBody::FollowUp {
                precise_origin_timestamp: origin_timestamp,
            }
            | PtpMessageBody::DelayReq { origin_timestamp } => {
                origin_timestamp.encode().to_vec()
            }
            PtpMessageBody::DelayResp {
                receive_timestamp,
                requesting_port_identity,
            } => {
                let mut buf = Vec::with_capacity(Self::DELAY_RESP_BODY_SIZE);
                buf.extend_from_slice(&receive_timestamp.encode());
                buf.extend_from_slice(&requesting_port_identity.encode());
                buf
            }
            PtpMessageBody::Announce {
                origin_timestamp,
                current_utc_offset,
                grandmaster_priority1,
                grandmaster_clock_quality,
                grandmaster_priority2,
                grandmaster_identity,
                steps_removed,
                time_source,
            } => {
                let mut buf = Vec::with_capacity(Self::ANNOUNCE_BODY_SIZE);
                buf.extend_from_slice(&origin_timestamp.encode());
                buf.extend_from_slice(&current_utc_offset.to_be_bytes());
                buf.push(0); // reserved
                buf.push(*grandmaster_priority1);
                buf.push(grandmaster_clock_quality.clock_class);
                buf.push(grandmaster_clock_quality.clock_accuracy);
                buf.extend_from_slice(
                    &grandmaster_clock_quality
                        .offset_scaled_log_variance
                        .to_be_bytes(),
                );
                buf.push(*grandmaster_priority2);
                buf.extend_from_slice(&grandmaster_identity.0.to_be_bytes());
                buf.extend_from_slice(&steps_removed.to_be_bytes());
                buf.push(*time_source);
                buf
            }
        }
    }

    /// Create a two-step Sync message (zero origin, precise time follows
    /// in the `Follow_Up`).
    #[must_use]
    pub fn sync(source: PortIdentity, sequence_id: u16, log_interval: i8) -> Self {
        let mut header = PtpHeader::new(PtpMessageType::Sync, source, sequence_id);
        header.flags |= FLAG_TWO_STEP;
        header.log_message_interval = log_interval;
        Self {
            header,
            body: PtpMessageBody::Sync {
                origin_timestamp: PtpTimestamp::ZERO,
            },
        }
    }

    /// Create a Follow-up carrying the Sync's egress timestamp.
    #[must_use]
    pub fn follow_up(
        source: PortIdentity,
        sequence_id: u16,
        log_interval: i8,
        precise_timestamp: PtpTimestamp,
    ) -> Self {
        let mut header = PtpHeader::new(PtpMessageType::FollowUp, source, sequence_id);
        header.log_message_interval = log_interval;
        Self {
            header,
            body: PtpMessageBody::FollowUp {
                precise_origin_timestamp: precise_timestamp,
            },
        }
    }

    /// Create a Delay Response echoing the request's sequence id and
    /// correction field.
    #[must_use]
    pub fn delay_resp(
        source: PortIdentity,
        sequence_id: u16,
        correction_field: i64,
        receive_timestamp: PtpTimestamp,
        requesting_port: PortIdentity,
    ) -> Self {
        let mut header = PtpHeader::new(PtpMessageType::DelayResp, source, sequence_id);
        header.correction_field = correction_field;
        Self {
            header,
            body: PtpMessageBody::DelayResp {
                receive_timestamp,
                requesting_port_identity: requesting_port,
            },
        }
    }

    /// Create an Announce message advertising this server as grandmaster.
    #[must_use]
    pub fn announce(
        source: PortIdentity,
        sequence_id: u16,
        log_interval: i8,
        current_utc_offset: i16,
        clock_quality: ClockQuality,
    ) -> Self {
        let mut header = PtpHeader::new(PtpMessageType::Announce, source, sequence_id);
        header.flags |= FLAG_PTP_TIMESCALE;
        header.log_message_interval = log_interval;
        Self {
            header,
            body: PtpMessageBody::Announce {
                origin_timestamp: PtpTimestamp::ZERO,
                current_utc_offset,
                grandmaster_priority1: 128,
                grandmaster_clock_quality: clock_quality,
                grandmaster_priority2: 128,
                grandmaster_identity: source.clock_identity,
                steps_removed: 0,
                time_source: TIME_SOURCE_GNSS,
            },
        }
    }
}

/// Errors from PTP message parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PtpParseError {
    /// Packet too short.
    #[error("packet too short: need {needed} bytes, have {have}")]
    TooShort {
        /// Minimum bytes needed.
        needed: usize,
        /// Bytes actually available.
        have: usize,
    },
    /// Unknown message type nibble.
    #[error("unknown PTP message type: 0x{0:02X}")]
    UnknownMessageType(u8),
    /// Signaling packets must be parsed by the signaling codec.
    #[error("signaling message routed to the wrong parser")]
    UnexpectedSignaling,
    /// TLV length field disagrees with the available bytes.
    #[error("bad TLV length {length} for TLV type 0x{tlv_type:04X}")]
    BadTlvLength {
        /// TLV type code.
        tlv_type: u16,
        /// Length field value.
        length: u16,
    },
}
