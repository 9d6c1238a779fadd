//! Typed payload layouts for the DoIP payload types processed by this crate.
//!
//! Decoders take the raw payload (header already stripped) and enforce the
//! exact sizes the wire format allows; encoders emit the payload only, ready
//! to be framed with [super::encode_frame]. Reserved values of the single
//! byte code fields are kept as raw bytes so decoding never loses
//! information.

use byteorder::{BigEndian, ByteOrder};

use super::{CodecError, CodecResult, PayloadType};

/// Length of a vehicle identification number on the wire
pub const VIN_LEN: usize = 17;
/// Length of an entity identification (EID) on the wire
pub const EID_LEN: usize = 6;
/// Length of a group identification (GID) on the wire
pub const GID_LEN: usize = 6;

/// Negative acknowledge codes carried by a generic DoIP header NACK (`0x0000`)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeaderNackCode {
    /// Header pattern (protocol version / inverse) is wrong
    IncorrectPatternFormat,
    /// Payload type is not known to the receiver
    UnknownPayloadType,
    /// Announced payload exceeds the receiver's limit
    MessageTooLarge,
    /// Receiver cannot allocate the announced payload
    OutOfMemory,
    /// Payload length does not match the payload type
    InvalidPayloadLength,
    /// Reserved code
    Reserved(u8),
}

impl From<u8> for HeaderNackCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => HeaderNackCode::IncorrectPatternFormat,
            0x01 => HeaderNackCode::UnknownPayloadType,
            0x02 => HeaderNackCode::MessageTooLarge,
            0x03 => HeaderNackCode::OutOfMemory,
            0x04 => HeaderNackCode::InvalidPayloadLength,
            x => HeaderNackCode::Reserved(x),
        }
    }
}

impl From<HeaderNackCode> for u8 {
    fn from(code: HeaderNackCode) -> Self {
        match code {
            HeaderNackCode::IncorrectPatternFormat => 0x00,
            HeaderNackCode::UnknownPayloadType => 0x01,
            HeaderNackCode::MessageTooLarge => 0x02,
            HeaderNackCode::OutOfMemory => 0x03,
            HeaderNackCode::InvalidPayloadLength => 0x04,
            HeaderNackCode::Reserved(x) => x,
        }
    }
}

/// Generic DoIP header negative acknowledge payload (`0x0000`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericNack {
    /// Reason the peer rejected the message
    pub nack_code: HeaderNackCode,
}

impl GenericNack {
    /// Payload type of this payload layout
    pub const PAYLOAD_TYPE: PayloadType = PayloadType::GenericNack;

    /// Encodes the 1 byte payload
    pub fn encode_payload(&self) -> Vec<u8> {
        vec![self.nack_code.into()]
    }

    /// Decodes the 1 byte payload
    pub fn decode_payload(payload: &[u8]) -> CodecResult<Self> {
        if payload.len() != 1 {
            return Err(malformed(Self::PAYLOAD_TYPE, payload));
        }
        Ok(Self {
            nack_code: HeaderNackCode::from(payload[0]),
        })
    }
}

/// Selector narrowing a vehicle identification request to one vehicle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EidVinSelector {
    /// Request identification from all listening entities
    None,
    /// Request identification from the entity with this EID
    Eid([u8; EID_LEN]),
    /// Request identification for the vehicle with this VIN
    Vin([u8; VIN_LEN]),
}

/// Vehicle identification request payload (`0x0001`), 0, 6 or 17 bytes
/// depending on the selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleIdentificationRequest {
    /// Optional EID or VIN selector
    pub selector: EidVinSelector,
}

impl VehicleIdentificationRequest {
    /// Payload type of this payload layout
    pub const PAYLOAD_TYPE: PayloadType = PayloadType::VehicleIdentificationRequest;

    /// Encodes the selector form of the payload
    pub fn encode_payload(&self) -> Vec<u8> {
        match &self.selector {
            EidVinSelector::None => Vec::new(),
            EidVinSelector::Eid(eid) => eid.to_vec(),
            EidVinSelector::Vin(vin) => vin.to_vec(),
        }
    }

    /// Decodes the payload, selecting the form by its length
    pub fn decode_payload(payload: &[u8]) -> CodecResult<Self> {
        let selector = match payload.len() {
            0 => EidVinSelector::None,
            EID_LEN => {
                let mut eid = [0u8; EID_LEN];
                eid.copy_from_slice(payload);
                EidVinSelector::Eid(eid)
            }
            VIN_LEN => {
                let mut vin = [0u8; VIN_LEN];
                vin.copy_from_slice(payload);
                EidVinSelector::Vin(vin)
            }
            _ => return Err(malformed(Self::PAYLOAD_TYPE, payload)),
        };
        Ok(Self { selector })
    }
}

/// Further action advertised by a vehicle announcement
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FurtherAction {
    /// No further action required
    None,
    /// Routing activation is required to initiate central security
    CentralSecurityRequired,
    /// Reserved code
    Reserved(u8),
    /// Manufacturer specific code
    VehicleManufacturerSpecific(u8),
}

impl From<u8> for FurtherAction {
    fn from(value: u8) -> Self {
        match value {
            0x00 => FurtherAction::None,
            0x10 => FurtherAction::CentralSecurityRequired,
            0x01..=0x0F => FurtherAction::Reserved(value),
            x => FurtherAction::VehicleManufacturerSpecific(x),
        }
    }
}

impl From<FurtherAction> for u8 {
    fn from(action: FurtherAction) -> Self {
        match action {
            FurtherAction::None => 0x00,
            FurtherAction::CentralSecurityRequired => 0x10,
            FurtherAction::Reserved(x) => x,
            FurtherAction::VehicleManufacturerSpecific(x) => x,
        }
    }
}

/// VIN/GID synchronization status advertised by a vehicle announcement
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// VIN and GID are synchronized across all entities
    Synchronized,
    /// VIN or GID synchronization is incomplete
    Incomplete,
    /// Reserved code
    Reserved(u8),
}

impl From<u8> for SyncStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => SyncStatus::Synchronized,
            0x10 => SyncStatus::Incomplete,
            x => SyncStatus::Reserved(x),
        }
    }
}

impl From<SyncStatus> for u8 {
    fn from(status: SyncStatus) -> Self {
        match status {
            SyncStatus::Synchronized => 0x00,
            SyncStatus::Incomplete => 0x10,
            SyncStatus::Reserved(x) => x,
        }
    }
}

/// Vehicle announcement / identification response payload (`0x0004`),
/// 32 bytes, or 33 with the trailing sync status byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleAnnouncement {
    /// Vehicle identification number
    pub vin: [u8; VIN_LEN],
    /// Logical address of the announcing entity
    pub logical_address: u16,
    /// Unique entity identification, typically a MAC address
    pub eid: [u8; EID_LEN],
    /// Group identification of the entities within the vehicle
    pub gid: [u8; GID_LEN],
    /// Whether the tester must take further action before diagnostics
    pub further_action: FurtherAction,
    /// VIN/GID sync status; omitted by some gateways
    pub sync_status: Option<SyncStatus>,
}

impl VehicleAnnouncement {
    /// Payload type of this payload layout
    pub const PAYLOAD_TYPE: PayloadType = PayloadType::VehicleAnnouncement;

    const BASE_LEN: usize = VIN_LEN + 2 + EID_LEN + GID_LEN + 1;

    /// Encodes the 32 or 33 byte payload
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::BASE_LEN + 1);
        buf.extend_from_slice(&self.vin);
        buf.extend_from_slice(&self.logical_address.to_be_bytes());
        buf.extend_from_slice(&self.eid);
        buf.extend_from_slice(&self.gid);
        buf.push(self.further_action.into());
        if let Some(status) = self.sync_status {
            buf.push(status.into());
        }
        buf
    }

    /// Decodes the 32 or 33 byte payload
    pub fn decode_payload(payload: &[u8]) -> CodecResult<Self> {
        if payload.len() != Self::BASE_LEN && payload.len() != Self::BASE_LEN + 1 {
            return Err(malformed(Self::PAYLOAD_TYPE, payload));
        }
        let mut vin = [0u8; VIN_LEN];
        vin.copy_from_slice(&payload[..VIN_LEN]);
        let logical_address = BigEndian::read_u16(&payload[VIN_LEN..VIN_LEN + 2]);
        let mut eid = [0u8; EID_LEN];
        eid.copy_from_slice(&payload[19..19 + EID_LEN]);
        let mut gid = [0u8; GID_LEN];
        gid.copy_from_slice(&payload[25..25 + GID_LEN]);
        let further_action = FurtherAction::from(payload[31]);
        let sync_status = payload.get(32).map(|&b| SyncStatus::from(b));
        Ok(Self {
            vin,
            logical_address,
            eid,
            gid,
            further_action,
            sync_status,
        })
    }
}

/// Routing activation types
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ActivationType {
    /// Default activation for ISO 14229 diagnostics
    Default,
    /// WWH-OBD activation
    WwhObd,
    /// OEM central security activation
    CentralSecurity,
    /// Reserved or manufacturer specific activation type
    Other(u8),
}

impl From<u8> for ActivationType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ActivationType::Default,
            0x01 => ActivationType::WwhObd,
            0x02 => ActivationType::CentralSecurity,
            x => ActivationType::Other(x),
        }
    }
}

impl From<ActivationType> for u8 {
    fn from(ty: ActivationType) -> Self {
        match ty {
            ActivationType::Default => 0x00,
            ActivationType::WwhObd => 0x01,
            ActivationType::CentralSecurity => 0x02,
            ActivationType::Other(x) => x,
        }
    }
}

/// Routing activation request payload (`0x0005`), 11 bytes, or 15 with the
/// second OEM specific trailer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingActivationRequest {
    /// Logical address of the requesting tester
    pub source_address: u16,
    /// Kind of routing to activate
    pub activation_type: ActivationType,
    /// Reserved by ISO 13400, transmitted as zero
    pub reserved: [u8; 4],
    /// Reserved for OEM use, transmitted as zero unless assigned
    pub reserved_oem: [u8; 4],
    /// Additional OEM specific extension
    pub oem_specific: Option<[u8; 4]>,
}

impl RoutingActivationRequest {
    /// Payload type of this payload layout
    pub const PAYLOAD_TYPE: PayloadType = PayloadType::RoutingActivationRequest;

    /// Creates a request with zeroed reserved fields and no OEM trailer
    pub fn new(source_address: u16, activation_type: ActivationType) -> Self {
        Self {
            source_address,
            activation_type,
            reserved: [0u8; 4],
            reserved_oem: [0u8; 4],
            oem_specific: None,
        }
    }

    /// Encodes the 11 or 15 byte payload
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(15);
        buf.extend_from_slice(&self.source_address.to_be_bytes());
        buf.push(self.activation_type.into());
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.reserved_oem);
        if let Some(oem) = self.oem_specific {
            buf.extend_from_slice(&oem);
        }
        buf
    }

    /// Decodes the 11 or 15 byte payload
    pub fn decode_payload(payload: &[u8]) -> CodecResult<Self> {
        if payload.len() != 11 && payload.len() != 15 {
            return Err(malformed(Self::PAYLOAD_TYPE, payload));
        }
        let source_address = BigEndian::read_u16(&payload[0..2]);
        let activation_type = ActivationType::from(payload[2]);
        let mut reserved = [0u8; 4];
        reserved.copy_from_slice(&payload[3..7]);
        let mut reserved_oem = [0u8; 4];
        reserved_oem.copy_from_slice(&payload[7..11]);
        let oem_specific = if payload.len() == 15 {
            let mut oem = [0u8; 4];
            oem.copy_from_slice(&payload[11..15]);
            Some(oem)
        } else {
            None
        };
        Ok(Self {
            source_address,
            activation_type,
            reserved,
            reserved_oem,
            oem_specific,
        })
    }
}

/// Routing activation response codes (ISO 13400-2 table 48)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RoutingActivationResponseCode {
    /// Denied, source address unknown
    DeniedUnknownSourceAddress,
    /// Denied, all TCP sockets registered and active
    DeniedAllSocketsTaken,
    /// Denied, source address already activated on another socket
    DeniedSourceAddressInUse,
    /// Denied, source address already registered on this socket
    DeniedSourceAddressAlreadyRegistered,
    /// Denied, missing authentication
    DeniedMissingAuthentication,
    /// Denied, rejected confirmation
    DeniedRejectedConfirmation,
    /// Denied, unsupported routing activation type
    DeniedUnsupportedActivationType,
    /// Denied, TLS required
    DeniedTlsRequired,
    /// Routing successfully activated
    SuccessfullyActivated,
    /// Activated, but confirmation is required before diagnostics
    ConfirmationRequired,
    /// Reserved code
    Reserved(u8),
}

impl From<u8> for RoutingActivationResponseCode {
    fn from(value: u8) -> Self {
        use RoutingActivationResponseCode::*;
        match value {
            0x00 => DeniedUnknownSourceAddress,
            0x01 => DeniedAllSocketsTaken,
            0x02 => DeniedSourceAddressInUse,
            0x03 => DeniedSourceAddressAlreadyRegistered,
            0x04 => DeniedMissingAuthentication,
            0x05 => DeniedRejectedConfirmation,
            0x06 => DeniedUnsupportedActivationType,
            0x07 => DeniedTlsRequired,
            0x10 => SuccessfullyActivated,
            0x11 => ConfirmationRequired,
            x => Reserved(x),
        }
    }
}

impl From<RoutingActivationResponseCode> for u8 {
    fn from(code: RoutingActivationResponseCode) -> Self {
        use RoutingActivationResponseCode::*;
        match code {
            DeniedUnknownSourceAddress => 0x00,
            DeniedAllSocketsTaken => 0x01,
            DeniedSourceAddressInUse => 0x02,
            DeniedSourceAddressAlreadyRegistered => 0x03,
            DeniedMissingAuthentication => 0x04,
            DeniedRejectedConfirmation => 0x05,
            DeniedUnsupportedActivationType => 0x06,
            DeniedTlsRequired => 0x07,
            SuccessfullyActivated => 0x10,
            ConfirmationRequired => 0x11,
            Reserved(x) => x,
        }
    }
}

/// Routing activation response payload (`0x0006`), 13 bytes, or 17 with the
/// second OEM specific trailer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingActivationResponse {
    /// Logical address of the tester the response is addressed to
    pub client_address: u16,
    /// Logical address of the responding DoIP entity
    pub entity_address: u16,
    /// Outcome of the activation request
    pub response_code: RoutingActivationResponseCode,
    /// Reserved by ISO 13400
    pub reserved: [u8; 4],
    /// Reserved for OEM use
    pub reserved_oem: [u8; 4],
    /// Additional OEM specific extension
    pub oem_specific: Option<[u8; 4]>,
}

impl RoutingActivationResponse {
    /// Payload type of this payload layout
    pub const PAYLOAD_TYPE: PayloadType = PayloadType::RoutingActivationResponse;

    /// Encodes the 13 or 17 byte payload
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(17);
        buf.extend_from_slice(&self.client_address.to_be_bytes());
        buf.extend_from_slice(&self.entity_address.to_be_bytes());
        buf.push(self.response_code.into());
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.reserved_oem);
        if let Some(oem) = self.oem_specific {
            buf.extend_from_slice(&oem);
        }
        buf
    }

    /// Decodes the 13 or 17 byte payload
    pub fn decode_payload(payload: &[u8]) -> CodecResult<Self> {
        if payload.len() != 13 && payload.len() != 17 {
            return Err(malformed(Self::PAYLOAD_TYPE, payload));
        }
        let client_address = BigEndian::read_u16(&payload[0..2]);
        let entity_address = BigEndian::read_u16(&payload[2..4]);
        let response_code = RoutingActivationResponseCode::from(payload[4]);
        let mut reserved = [0u8; 4];
        reserved.copy_from_slice(&payload[5..9]);
        let mut reserved_oem = [0u8; 4];
        reserved_oem.copy_from_slice(&payload[9..13]);
        let oem_specific = if payload.len() == 17 {
            let mut oem = [0u8; 4];
            oem.copy_from_slice(&payload[13..17]);
            Some(oem)
        } else {
            None
        };
        Ok(Self {
            client_address,
            entity_address,
            response_code,
            reserved,
            reserved_oem,
            oem_specific,
        })
    }
}

/// Diagnostic message payload (`0x8001`): source and target logical address
/// followed by at least one byte of UDS data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticMessage {
    /// Logical address of the sender
    pub source_address: u16,
    /// Logical address of the receiver
    pub target_address: u16,
    /// UDS request or response bytes
    pub user_data: Vec<u8>,
}

impl DiagnosticMessage {
    /// Payload type of this payload layout
    pub const PAYLOAD_TYPE: PayloadType = PayloadType::DiagnosticMessage;

    /// Encodes the payload
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.user_data.len());
        buf.extend_from_slice(&self.source_address.to_be_bytes());
        buf.extend_from_slice(&self.target_address.to_be_bytes());
        buf.extend_from_slice(&self.user_data);
        buf
    }

    /// Decodes the payload; requires at least one byte of user data
    pub fn decode_payload(payload: &[u8]) -> CodecResult<Self> {
        if payload.len() < 5 {
            return Err(malformed(Self::PAYLOAD_TYPE, payload));
        }
        Ok(Self {
            source_address: BigEndian::read_u16(&payload[0..2]),
            target_address: BigEndian::read_u16(&payload[2..4]),
            user_data: payload[4..].to_vec(),
        })
    }
}

/// Negative acknowledge codes for a rejected diagnostic message (`0x8003`)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiagnosticNackCode {
    /// Source address is not activated on this socket
    InvalidSourceAddress,
    /// Target address is not known to the gateway
    UnknownTargetAddress,
    /// Message exceeds the transport's maximum size
    MessageTooLarge,
    /// Gateway cannot buffer the message
    OutOfMemory,
    /// Target is known but currently unreachable
    TargetUnreachable,
    /// No network to route the message onto
    UnknownNetwork,
    /// Transport protocol error on the target network
    TransportProtocolError,
    /// Reserved code
    Reserved(u8),
}

impl From<u8> for DiagnosticNackCode {
    fn from(value: u8) -> Self {
        use DiagnosticNackCode::*;
        match value {
            0x02 => InvalidSourceAddress,
            0x03 => UnknownTargetAddress,
            0x04 => MessageTooLarge,
            0x05 => OutOfMemory,
            0x06 => TargetUnreachable,
            0x07 => UnknownNetwork,
            0x08 => TransportProtocolError,
            x => Reserved(x),
        }
    }
}

impl From<DiagnosticNackCode> for u8 {
    fn from(code: DiagnosticNackCode) -> Self {
        use DiagnosticNackCode::*;
        match code {
            InvalidSourceAddress => 0x02,
            UnknownTargetAddress => 0x03,
            MessageTooLarge => 0x04,
            OutOfMemory => 0x05,
            TargetUnreachable => 0x06,
            UnknownNetwork => 0x07,
            TransportProtocolError => 0x08,
            Reserved(x) => x,
        }
    }
}

/// Diagnostic message positive acknowledge payload (`0x8002`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticMessagePositiveAck {
    /// Logical address of the acknowledging entity
    pub source_address: u16,
    /// Logical address of the tester
    pub target_address: u16,
    /// Acknowledge code, 0x00 for routing confirmation
    pub ack_code: u8,
    /// Echo of the acknowledged diagnostic message, possibly truncated
    pub previous_message: Vec<u8>,
}

impl DiagnosticMessagePositiveAck {
    /// Payload type of this payload layout
    pub const PAYLOAD_TYPE: PayloadType = PayloadType::DiagnosticMessagePositiveAck;

    /// Encodes the payload
    pub fn encode_payload(&self) -> Vec<u8> {
        encode_diag_ack(
            self.source_address,
            self.target_address,
            self.ack_code,
            &self.previous_message,
        )
    }

    /// Decodes the payload
    pub fn decode_payload(payload: &[u8]) -> CodecResult<Self> {
        let (source_address, target_address, ack_code, previous_message) =
            decode_diag_ack(Self::PAYLOAD_TYPE, payload)?;
        Ok(Self {
            source_address,
            target_address,
            ack_code,
            previous_message,
        })
    }
}

/// Diagnostic message negative acknowledge payload (`0x8003`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticMessageNegativeAck {
    /// Logical address of the rejecting entity
    pub source_address: u16,
    /// Logical address of the tester
    pub target_address: u16,
    /// Reason the diagnostic message was rejected
    pub nack_code: DiagnosticNackCode,
    /// Echo of the rejected diagnostic message, possibly truncated
    pub previous_message: Vec<u8>,
}

impl DiagnosticMessageNegativeAck {
    /// Payload type of this payload layout
    pub const PAYLOAD_TYPE: PayloadType = PayloadType::DiagnosticMessageNegativeAck;

    /// Encodes the payload
    pub fn encode_payload(&self) -> Vec<u8> {
        encode_diag_ack(
            self.source_address,
            self.target_address,
            self.nack_code.into(),
            &self.previous_message,
        )
    }

    /// Decodes the payload
    pub fn decode_payload(payload: &[u8]) -> CodecResult<Self> {
        let (source_address, target_address, code, previous_message) =
            decode_diag_ack(Self::PAYLOAD_TYPE, payload)?;
        Ok(Self {
            source_address,
            target_address,
            nack_code: DiagnosticNackCode::from(code),
            previous_message,
        })
    }
}

fn encode_diag_ack(source: u16, target: u16, code: u8, previous: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + previous.len());
    buf.extend_from_slice(&source.to_be_bytes());
    buf.extend_from_slice(&target.to_be_bytes());
    buf.push(code);
    buf.extend_from_slice(previous);
    buf
}

fn decode_diag_ack(ty: PayloadType, payload: &[u8]) -> CodecResult<(u16, u16, u8, Vec<u8>)> {
    if payload.len() < 5 {
        return Err(malformed(ty, payload));
    }
    Ok((
        BigEndian::read_u16(&payload[0..2]),
        BigEndian::read_u16(&payload[2..4]),
        payload[4],
        payload[5..].to_vec(),
    ))
}

fn malformed(ty: PayloadType, payload: &[u8]) -> CodecError {
    CodecError::Malformed {
        payload_type: ty.into(),
        len: payload.len(),
    }
}
