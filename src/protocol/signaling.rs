//! Signaling messages and unicast negotiation TLVs.
//!
//! Unicast subscriptions are negotiated over Signaling messages on the
//! general port (IEEE 1588-2008 Section 16.1): a client asks for a
//! message stream with `REQUEST_UNICAST_TRANSMISSION` and the server
//! answers with `GRANT_UNICAST_TRANSMISSION`. A grant with
//! `duration_field = 0` is an effective deny. Cancellation uses the
//! `CANCEL` / `ACKNOWLEDGE_CANCEL` pair.
//!
//! TLVs carry the negotiated message type as a raw nibble rather than a
//! parsed [`PtpMessageType`]: a request for a type this server never
//! emits must still round-trip into a zero-duration grant instead of
//! failing the parse.

use super::message::{PortIdentity, PtpHeader, PtpMessageType, PtpParseError};

/// TLV type: `REQUEST_UNICAST_TRANSMISSION`.
pub const TLV_REQUEST_UNICAST_TRANSMISSION: u16 = 0x0004;
/// TLV type: `GRANT_UNICAST_TRANSMISSION`.
pub const TLV_GRANT_UNICAST_TRANSMISSION: u16 = 0x0005;
/// TLV type: `CANCEL_UNICAST_TRANSMISSION`.
pub const TLV_CANCEL_UNICAST_TRANSMISSION: u16 = 0x0006;
/// TLV type: `ACKNOWLEDGE_CANCEL_UNICAST_TRANSMISSION`.
pub const TLV_ACKNOWLEDGE_CANCEL_UNICAST_TRANSMISSION: u16 = 0x0007;

/// Request for a unicast message stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestUnicastTransmission {
    /// Requested message type as a raw nibble.
    pub msg_nibble: u8,
    /// Requested cadence as log2 seconds.
    pub log_inter_message_period: i8,
    /// Requested grant duration in seconds.
    pub duration_field: u32,
}

impl RequestUnicastTransmission {
    /// Requested message type, if it is one this implementation knows.
    ///
    /// # Errors
    /// Returns [`PtpParseError::UnknownMessageType`] for nibbles outside
    /// the supported set.
    pub fn message_type(&self) -> Result<PtpMessageType, PtpParseError> {
        PtpMessageType::from_nibble(self.msg_nibble)
    }
}

/// Grant (or deny, when `duration_field == 0`) of a unicast stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantUnicastTransmission {
    /// Granted message type as a raw nibble (echoes the request).
    pub msg_nibble: u8,
    /// Granted cadence as log2 seconds.
    pub log_inter_message_period: i8,
    /// Granted duration in seconds; zero denies the request.
    pub duration_field: u32,
    /// Whether the client is invited to renew before expiry.
    pub renewal_invited: bool,
}

/// Cancellation of a previously granted stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelUnicastTransmission {
    /// Cancelled message type as a raw nibble.
    pub msg_nibble: u8,
}

/// A TLV carried in a Signaling message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingTlv {
    /// `REQUEST_UNICAST_TRANSMISSION`.
    Request(RequestUnicastTransmission),
    /// `GRANT_UNICAST_TRANSMISSION`.
    Grant(GrantUnicastTransmission),
    /// `CANCEL_UNICAST_TRANSMISSION`.
    Cancel(CancelUnicastTransmission),
    /// `ACKNOWLEDGE_CANCEL_UNICAST_TRANSMISSION`.
    AcknowledgeCancel(CancelUnicastTransmission),
    /// Any TLV this server does not interpret; retained for accounting.
    Other {
        /// TLV type code.
        tlv_type: u16,
    },
}

impl SignalingTlv {
    /// Build a request for the given message type.
    #[must_use]
    pub fn request(
        msg_type: PtpMessageType,
        log_inter_message_period: i8,
        duration_field: u32,
    ) -> Self {
        Self::Request(RequestUnicastTransmission {
            msg_nibble: msg_type as u8,
            log_inter_message_period,
            duration_field,
        })
    }

    /// Encode this TLV (type, length, value).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        match self {
            Self::Request(req) => {
                buf.extend_from_slice(&TLV_REQUEST_UNICAST_TRANSMISSION.to_be_bytes());
                buf.extend_from_slice(&6u16.to_be_bytes());
                buf.push(req.msg_nibble << 4);
                buf.push(req.log_inter_message_period as u8);
                buf.extend_from_slice(&req.duration_field.to_be_bytes());
            }
            Self::Grant(grant) => {
                buf.extend_from_slice(&TLV_GRANT_UNICAST_TRANSMISSION.to_be_bytes());
                buf.extend_from_slice(&8u16.to_be_bytes());
                buf.push(grant.msg_nibble << 4);
                buf.push(grant.log_inter_message_period as u8);
                buf.extend_from_slice(&grant.duration_field.to_be_bytes());
                buf.push(0); // reserved
                buf.push(u8::from(grant.renewal_invited));
            }
            Self::Cancel(cancel) => {
                buf.extend_from_slice(&TLV_CANCEL_UNICAST_TRANSMISSION.to_be_bytes());
                buf.extend_from_slice(&2u16.to_be_bytes());
                buf.push(cancel.msg_nibble << 4);
                buf.push(0); // reserved
            }
            Self::AcknowledgeCancel(cancel) => {
                buf.extend_from_slice(
                    &TLV_ACKNOWLEDGE_CANCEL_UNICAST_TRANSMISSION.to_be_bytes(),
                );
                buf.extend_from_slice(&2u16.to_be_bytes());
                buf.push(cancel.msg_nibble << 4);
                buf.push(0); // reserved
            }
            Self::Other { tlv_type } => {
                buf.extend_from_slice(&tlv_type.to_be_bytes());
                buf.extend_from_slice(&0u16.to_be_bytes());
            }
        }
        buf
    }

    /// Decode one TLV value. `value` is the payload after the 4-byte
    /// type/length prefix.
    fn decode_value(tlv_type: u16, value: &[u8]) -> Result<Self, PtpParseError> {
        #[allow(
            clippy::cast_possible_truncation,
            reason = "Value length was parsed from a u16 field"
        )]
        let value_len = value.len() as u16;
        let bad_len = || PtpParseError::BadTlvLength {
            tlv_type,
            length: value_len,
        };
        match tlv_type {
            TLV_REQUEST_UNICAST_TRANSMISSION => {
                if value.len() < 6 {
                    return Err(bad_len());
                }
                Ok(Self::Request(RequestUnicastTransmission {
                    msg_nibble: value[0] >> 4,
                    log_inter_message_period: value[1] as i8,
                    duration_field: u32::from_be_bytes([value[2], value[3], value[4], value[5]]),
                }))
            }
            TLV_GRANT_UNICAST_TRANSMISSION => {
                if value.len() < 8 {
                    return Err(bad_len());
                }
                Ok(Self::Grant(GrantUnicastTransmission {
                    msg_nibble: value[0] >> 4,
                    log_inter_message_period: value[1] as i8,
                    duration_field: u32::from_be_bytes([value[2], value[3], value[4], value[5]]),
                    renewal_invited: value[7] & 0x01 != 0,
                }))
            }
            TLV_CANCEL_UNICAST_TRANSMISSION => {
                if value.len() < 2 {
                    return Err(bad_len());
                }
                Ok(Self::Cancel(CancelUnicastTransmission {
                    msg_nibble: value[0] >> 4,
                }))
            }
            TLV_ACKNOWLEDGE_CANCEL_UNICAST_TRANSMISSION => {
                if value.len() < 2 {
                    return Err(bad_len());
                }
                Ok(Self::AcknowledgeCancel(CancelUnicastTransmission {
                    msg_nibble: value[0] >> 4,
                }))
            }
            other => Ok(Self::Other { tlv_type: other }),
        }
    }
}

/// A Signaling message: header, target port identity, TLVs.
#[derive(Debug, Clone)]
pub struct SignalingMessage {
    /// Message header (`message_type` is always Signaling).
    pub header: PtpHeader,
    /// Port identity the message is addressed to.
    pub target_port_identity: PortIdentity,
    /// Carried TLVs, in wire order.
    pub tlvs: Vec<SignalingTlv>,
}

impl SignalingMessage {
    /// Create a Signaling message carrying the given TLVs.
    #[must_use]
    pub fn new(
        source: PortIdentity,
        target: PortIdentity,
        sequence_id: u16,
        tlvs: Vec<SignalingTlv>,
    ) -> Self {
        Self {
            header: PtpHeader::new(PtpMessageType::Signaling, source, sequence_id),
            target_port_identity: target,
            tlvs,
        }
    }

    /// Parse a Signaling message from bytes.
    ///
    /// TLVs with a length field overrunning the packet abort the parse;
    /// unknown TLV types are preserved as [`SignalingTlv::Other`].
    pub fn decode(data: &[u8]) -> Result<Self, PtpParseError> {
        let header = PtpHeader::decode(data)?;
        if header.message_type != PtpMessageType::Signaling {
            return Err(PtpParseError::UnknownMessageType(header.message_type as u8));
        }
        let body = &data[PtpHeader::SIZE..];
        let target_port_identity =
            PortIdentity::decode(body).ok_or(PtpParseError::TooShort {
                needed: PtpHeader::SIZE + PortIdentity::WIRE_SIZE,
                have: data.len(),
            })?;

        let mut tlvs = Vec::new();
        let mut rest = &body[PortIdentity::WIRE_SIZE..];
        while rest.len() >= 4 {
            let tlv_type = u16::from_be_bytes([rest[0], rest[1]]);
            let length = u16::from_be_bytes([rest[2], rest[3]]);
            let end = 4 + usize::from(length);
            if rest.len() < end {
                return Err(PtpParseError::BadTlvLength { tlv_type, length });
            }
            tlvs.push(SignalingTlv::decode_value(tlv_type, &rest[4..end])?);
            rest = &rest[end..];
        }

        Ok(Self {
            header,
            target_port_identity,
            tlvs,
        })
    }

    /// Encode to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(PortIdentity::WIRE_SIZE + 12 * self.tlvs.len());
        body.extend_from_slice(&self.target_port_identity.encode());
        for tlv in &self.tlvs {
            body.extend_from_slice(&tlv.encode());
        }
        let header_bytes = self.header.encode(body.len());
        let mut buf = Vec::with_capacity(PtpHeader::SIZE + body.len());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&body);
        buf
    }
}
