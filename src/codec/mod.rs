//! Module for encoding and decoding DoIP (ISO 13400-2) messages
//!
//! Every DoIP message consists of a fixed 8 byte generic header followed by a
//! payload whose layout is selected by the header's payload type. All integers
//! on the wire are big-endian. The functions in this module are pure and
//! perform no I/O; framing against a socket is the job of the channel layer.

mod payload;

pub use payload::*;

use byteorder::{BigEndian, ByteOrder};

/// Codec result
pub type CodecResult<T> = Result<T, CodecError>;

/// Length of the generic DoIP header in bytes
pub const DOIP_HEADER_LEN: usize = 8;

/// Protocol version byte for ISO 13400-2:2012
pub const PROTOCOL_VERSION_ISO_13400_2_2012: u8 = 0x02;

/// Largest payload length the header field can express (4 GiB - 1).
/// Channels apply far smaller ceilings on top of this.
pub const DOIP_MAX_PAYLOAD_LEN: u32 = 0xFFFF_FFFF;

/// TCP/UDP port registered for DoIP vehicle discovery and diagnostics
pub const DOIP_PORT: u16 = 13400;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// Error produced while encoding or decoding DoIP messages
pub enum CodecError {
    /// The header's inverse protocol version byte is not the complement of the
    /// protocol version byte
    #[error("invalid protocol version 0x{version:02X} (inverse 0x{inverse:02X})")]
    InvalidProtocolVersion {
        /// Protocol version byte as received
        version: u8,
        /// Inverse protocol version byte as received
        inverse: u8,
    },
    /// The header announces a payload longer than the permitted ceiling
    #[error("payload length {length} exceeds maximum of {max}")]
    InvalidPayloadLength {
        /// Payload length announced by the header
        length: u32,
        /// Ceiling the decoder was asked to enforce
        max: u32,
    },
    /// Payload type is not one the receiving channel processes
    #[error("unsupported payload type 0x{0:04X}")]
    UnsupportedPayloadType(u16),
    /// Payload length does not fit the layout of its payload type
    #[error("malformed payload of type 0x{payload_type:04X} ({len} bytes)")]
    Malformed {
        /// Raw payload type value
        payload_type: u16,
        /// Actual payload length in bytes
        len: usize,
    },
}

/// DoIP payload types handled by this crate. Every other value decodes as
/// [PayloadType::Unsupported] and is rejected by the channel dispatcher, not
/// by the header decoder.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadType {
    /// Generic DoIP header negative acknowledge (`0x0000`)
    GenericNack,
    /// Vehicle identification request, optionally with EID or VIN selector (`0x0001`)
    VehicleIdentificationRequest,
    /// Vehicle announcement / identification response (`0x0004`)
    VehicleAnnouncement,
    /// Routing activation request (`0x0005`)
    RoutingActivationRequest,
    /// Routing activation response (`0x0006`)
    RoutingActivationResponse,
    /// Diagnostic message (`0x8001`)
    DiagnosticMessage,
    /// Diagnostic message positive acknowledge (`0x8002`)
    DiagnosticMessagePositiveAck,
    /// Diagnostic message negative acknowledge (`0x8003`)
    DiagnosticMessageNegativeAck,
    /// Any payload type this crate does not process
    Unsupported(u16),
}

impl From<u16> for PayloadType {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => PayloadType::GenericNack,
            0x0001 => PayloadType::VehicleIdentificationRequest,
            0x0004 => PayloadType::VehicleAnnouncement,
            0x0005 => PayloadType::RoutingActivationRequest,
            0x0006 => PayloadType::RoutingActivationResponse,
            0x8001 => PayloadType::DiagnosticMessage,
            0x8002 => PayloadType::DiagnosticMessagePositiveAck,
            0x8003 => PayloadType::DiagnosticMessageNegativeAck,
            x => PayloadType::Unsupported(x),
        }
    }
}

impl From<PayloadType> for u16 {
    fn from(ty: PayloadType) -> Self {
        match ty {
            PayloadType::GenericNack => 0x0000,
            PayloadType::VehicleIdentificationRequest => 0x0001,
            PayloadType::VehicleAnnouncement => 0x0004,
            PayloadType::RoutingActivationRequest => 0x0005,
            PayloadType::RoutingActivationResponse => 0x0006,
            PayloadType::DiagnosticMessage => 0x8001,
            PayloadType::DiagnosticMessagePositiveAck => 0x8002,
            PayloadType::DiagnosticMessageNegativeAck => 0x8003,
            PayloadType::Unsupported(x) => x,
        }
    }
}

/// Generic DoIP header prefixing every message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoipHeader {
    /// Protocol version byte (0x02 for ISO 13400-2:2012)
    pub protocol_version: u8,
    /// Bitwise complement of the protocol version byte
    pub inverse_protocol_version: u8,
    /// Payload type selecting the payload layout
    pub payload_type: PayloadType,
    /// Number of payload bytes following the header
    pub payload_length: u32,
}

impl DoipHeader {
    /// Creates a header for the given payload type and length
    pub fn new(protocol_version: u8, payload_type: PayloadType, payload_length: u32) -> Self {
        Self {
            protocol_version,
            inverse_protocol_version: !protocol_version,
            payload_type,
            payload_length,
        }
    }

    /// Encodes the header into its 8 byte wire form
    pub fn encode(&self) -> [u8; DOIP_HEADER_LEN] {
        let mut buf = [0u8; DOIP_HEADER_LEN];
        buf[0] = self.protocol_version;
        buf[1] = self.inverse_protocol_version;
        BigEndian::write_u16(&mut buf[2..4], self.payload_type.into());
        BigEndian::write_u32(&mut buf[4..8], self.payload_length);
        buf
    }

    /// Decodes an 8 byte generic header.
    ///
    /// Fails with [CodecError::InvalidProtocolVersion] when the inverse byte
    /// check fails and [CodecError::InvalidPayloadLength] when the announced
    /// payload length exceeds `max_payload_len`. Unknown payload types decode
    /// successfully as [PayloadType::Unsupported] and are left to the
    /// dispatcher to reject.
    pub fn decode(bytes: &[u8; DOIP_HEADER_LEN], max_payload_len: u32) -> CodecResult<Self> {
        let protocol_version = bytes[0];
        let inverse_protocol_version = bytes[1];
        if inverse_protocol_version != !protocol_version {
            return Err(CodecError::InvalidProtocolVersion {
                version: protocol_version,
                inverse: inverse_protocol_version,
            });
        }
        let payload_type = PayloadType::from(BigEndian::read_u16(&bytes[2..4]));
        let payload_length = BigEndian::read_u32(&bytes[4..8]);
        if payload_length > max_payload_len {
            return Err(CodecError::InvalidPayloadLength {
                length: payload_length,
                max: max_payload_len,
            });
        }
        Ok(Self {
            protocol_version,
            inverse_protocol_version,
            payload_type,
            payload_length,
        })
    }
}

/// Assembles a complete DoIP frame (header followed by payload)
pub fn encode_frame(protocol_version: u8, payload_type: PayloadType, payload: &[u8]) -> Vec<u8> {
    let header = DoipHeader::new(protocol_version, payload_type, payload.len() as u32);
    let mut frame = Vec::with_capacity(DOIP_HEADER_LEN + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);
    frame
}

/// A decoded DoIP message together with the endpoint it came from
#[derive(Debug, Clone)]
pub struct DoipMessage {
    /// Decoded generic header
    pub header: DoipHeader,
    /// Owned payload bytes, `header.payload_length` long
    pub payload: Vec<u8>,
    /// Endpoint the message was received from
    pub source: std::net::SocketAddr,
}
