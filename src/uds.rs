//! Types shared with the UDS transport layer sitting on top of this crate
//!
//! The UDS layer hands [UdsMessage]s to the client for transmission and
//! receives incoming diagnostic responses through the [UdsMessageHandler]
//! callbacks it supplies at construction. Delivery is a two step protocol:
//! the channel first announces an incoming message with
//! [UdsMessageHandler::indicate_message] (address pair and payload size), and
//! only if that is accepted hands over the payload with
//! [UdsMessageHandler::handle_message].

use std::net::IpAddr;

use crate::codec::DiagnosticNackCode;

/// Addressing scheme of a diagnostic target
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TargetAddressType {
    /// Request addressed to a single ECU
    Physical,
    /// Request addressed to a functional group of ECUs
    Functional,
}

/// A UDS message as seen by the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdsMessage {
    /// Logical address of the sender
    pub source_address: u16,
    /// Logical address of the receiver
    pub target_address: u16,
    /// Whether the target address is physical or functional
    pub target_address_type: TargetAddressType,
    /// IP of the remote host the message goes to / came from
    pub host_ip: IpAddr,
    /// UDS service bytes
    pub payload: Vec<u8>,
}

/// Outcome of announcing an incoming message to the UDS layer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IndicationResult {
    /// The UDS layer accepts the message; [UdsMessageHandler::handle_message]
    /// follows
    Ok,
    /// The UDS layer is still busy with a previous indication
    Occupied,
    /// The UDS layer cannot buffer a payload of the announced size
    Overflow,
}

/// Callbacks the channel invokes on the UDS layer. Called from the channel's
/// reader task; implementations must not block on channel operations.
pub trait UdsMessageHandler: Send {
    /// Announces an incoming diagnostic message of `size` payload bytes from
    /// `source_address` to `target_address`. Returning anything but
    /// [IndicationResult::Ok] discards the message.
    fn indicate_message(
        &mut self,
        source_address: u16,
        target_address: u16,
        target_address_type: TargetAddressType,
        size: usize,
        host_ip: IpAddr,
    ) -> IndicationResult;

    /// Delivers the message announced by the preceding
    /// [UdsMessageHandler::indicate_message], transferring payload ownership.
    fn handle_message(&mut self, message: UdsMessage);
}

/// Result of a connect request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionResult {
    /// TCP (and TLS, when enabled) connection established
    Connected,
    /// Connection could not be established
    ConnectFailed,
    /// Connection attempt exceeded the configured timeout
    ConnectTimeout,
}

/// Result of a disconnect request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DisconnectionResult {
    /// Connection shut down
    Disconnected,
    /// Shutdown failed
    DisconnectFailed,
}

/// Result of a routing activation handshake
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RoutingActivationResult {
    /// Gateway activated routing for the requested source address
    Successful,
    /// Gateway rejected the activation, or no response arrived in time
    Failed,
    /// The channel disconnected while the handshake was outstanding
    Canceled,
}

/// Result of a diagnostic message transmission
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransmissionResult {
    /// Request acknowledged and the final response was delivered through the
    /// [UdsMessageHandler] callbacks
    TransmitOk,
    /// Request could not be written to the channel
    TransmitFailed,
    /// A previous request is still outstanding on this channel
    BusyProcessing,
    /// The gateway did not acknowledge the request
    NoTransmitAckReceived,
    /// The gateway rejected the request
    NegAckReceived(DiagnosticNackCode),
    /// Neither acknowledgement nor response arrived within the configured
    /// timeouts
    NoResponseReceived,
    /// The ECU kept answering response-pending beyond the configured limit
    ResponsePendingOverflow,
    /// The channel disconnected while the request was outstanding
    Canceled,
}
