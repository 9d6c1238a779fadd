//! TCP channel: one connection to a DoIP gateway plus its reader task
//!
//! The channel owns the write half of the byte-stream transport and a
//! dedicated reader thread. The thread alternates between *paused* and
//! *reading*: it is parked on a condition variable until a connect hands it
//! the read half, then frames messages off the wire (8 byte header, then the
//! announced payload) and dispatches them to the routing activation and
//! diagnostic sub-handlers. Peer EOF, a read error or a local shutdown end
//! the reading phase; the thread marks the channel disconnected, which wakes
//! every parked request with a cancellation, and parks itself again.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, warn};

use crate::client::DoipClientOptions;
use crate::codec::{
    encode_frame, CodecError, DoipHeader, GenericNack, HeaderNackCode, PayloadType,
    DOIP_HEADER_LEN, DOIP_MAX_PAYLOAD_LEN,
};
use crate::transport::{ByteStreamTransport, TransportError};
use crate::uds::{
    ConnectionResult, DisconnectionResult, RoutingActivationResult, TransmissionResult,
    UdsMessage, UdsMessageHandler,
};

use super::diagnostic_message::{
    process_diagnostic_message, process_negative_ack, process_positive_ack,
    DiagnosticMessageHandler,
};
use super::routing_activation::{process_routing_activation_response, RoutingActivationHandler};
use super::{ConnectionState, RoutingActivationState, SharedChannelState, CONTROL_PAYLOAD_CEILING};

/// Pause gate between the channel and its reader thread. `transport` is the
/// hand-over slot for the read half of a freshly connected stream.
struct ReaderGate {
    ctrl: Mutex<ReaderCtrl>,
    cond: Condvar,
}

struct ReaderCtrl {
    running: bool,
    exit_request: bool,
    transport: Option<Box<dyn ByteStreamTransport>>,
}

/// The per-frame parameters the reader needs from the channel options
struct ReaderConfig {
    protocol_version: u8,
    max_payload_len: u32,
    max_response_pending: u8,
}

/// One TCP (or TLS) connection to a DoIP gateway
pub struct DoipTcpChannel {
    shared: Arc<SharedChannelState>,
    gate: Arc<ReaderGate>,
    writer: Option<Box<dyn ByteStreamTransport>>,
    reader_thread: Option<JoinHandle<()>>,
    routing: RoutingActivationHandler,
    diagnostic: DiagnosticMessageHandler,
    read_timeout: Option<std::time::Duration>,
}

impl DoipTcpChannel {
    /// Creates the channel and spawns its (initially paused) reader thread.
    /// `handler` receives every incoming diagnostic response.
    pub fn new(options: &DoipClientOptions, handler: Box<dyn UdsMessageHandler>) -> Self {
        let shared = Arc::new(SharedChannelState::new());
        let gate = Arc::new(ReaderGate {
            ctrl: Mutex::new(ReaderCtrl {
                running: false,
                exit_request: false,
                transport: None,
            }),
            cond: Condvar::new(),
        });
        let config = ReaderConfig {
            protocol_version: options.protocol_version,
            max_payload_len: options.max_payload_len,
            max_response_pending: options.max_response_pending,
        };
        let reader_thread = {
            let gate = gate.clone();
            let shared = shared.clone();
            std::thread::spawn(move || reader_task(gate, shared, handler, config))
        };
        Self {
            routing: RoutingActivationHandler::new(
                shared.clone(),
                options.routing_activation_timeout,
                options.protocol_version,
            ),
            diagnostic: DiagnosticMessageHandler::new(
                shared.clone(),
                options.diagnostic_ack_timeout,
                options.diagnostic_response_timeout,
                options.protocol_version,
            ),
            shared,
            gate,
            writer: None,
            reader_thread: Some(reader_thread),
            read_timeout: options.tcp_read_timeout,
        }
    }

    /// Connects `transport` to `remote` and starts the reader. The transport
    /// must already be opened (socket created, local endpoint bound).
    pub fn connect(
        &mut self,
        mut transport: Box<dyn ByteStreamTransport>,
        remote: SocketAddr,
    ) -> ConnectionResult {
        if self.shared.lock().connection == ConnectionState::Connected {
            warn!("connect requested while already connected");
            return ConnectionResult::ConnectFailed;
        }
        if let Err(e) = transport.connect(remote) {
            error!("connect to {remote} failed: {e}");
            return match e {
                TransportError::ConnectTimeout => ConnectionResult::ConnectTimeout,
                _ => ConnectionResult::ConnectFailed,
            };
        }
        if let Err(e) = transport.set_read_timeout(self.read_timeout) {
            error!("failed to apply read timeout: {e}");
            transport.shutdown();
            return ConnectionResult::ConnectFailed;
        }

        // wait for the reader to finish winding down a previous connection
        // before handing it the new read half
        {
            let mut ctrl = self.gate.ctrl.lock().unwrap();
            while ctrl.running {
                ctrl = self.gate.cond.wait(ctrl).unwrap();
            }
            let mut state = self.shared.lock();
            state.connection = ConnectionState::Connected;
            state.routing = super::RoutingActivationState::Idle;
            state.diagnostic = super::DiagnosticMessageState::Idle;
            state.routing_response = None;
            state.diagnostic_outcome = None;
            state.pending_count = 0;
            drop(state);
            ctrl.transport = Some(transport.clone_stream());
            ctrl.running = true;
            self.gate.cond.notify_all();
        }
        self.writer = Some(transport);
        debug!("channel connected to {remote}");
        ConnectionResult::Connected
    }

    /// Shuts the connection down, waking any parked request with a
    /// cancellation. The reader pauses once it observes the close.
    pub fn disconnect(&mut self) -> DisconnectionResult {
        let Some(mut writer) = self.writer.take() else {
            warn!("disconnect requested while not connected");
            return DisconnectionResult::DisconnectFailed;
        };
        writer.shutdown();
        self.shared.disconnect();
        debug!("channel disconnected");
        DisconnectionResult::Disconnected
    }

    /// Runs the routing activation handshake for `source_address`
    pub fn activate_routing(
        &mut self,
        source_address: u16,
        activation_type: crate::codec::ActivationType,
    ) -> RoutingActivationResult {
        let Some(writer) = self.writer.as_mut() else {
            warn!("routing activation requested while not connected");
            return RoutingActivationResult::Failed;
        };
        self.routing
            .activate(writer.as_mut(), source_address, activation_type)
    }

    /// Transmits one diagnostic request and drives it to its conclusion
    pub fn transmit(&mut self, message: &UdsMessage) -> TransmissionResult {
        let Some(writer) = self.writer.as_mut() else {
            warn!("diagnostic transmission while not connected");
            return TransmissionResult::TransmitFailed;
        };
        self.diagnostic.transmit(writer.as_mut(), message)
    }

    /// Current connection sub-state
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lock().connection
    }

    /// Whether routing is activated on this connection, i.e. diagnostic
    /// transmission is permitted
    pub fn is_routing_activated(&self) -> bool {
        self.shared.lock().routing == RoutingActivationState::RoutingActivationSuccessful
    }
}

impl Drop for DoipTcpChannel {
    fn drop(&mut self) {
        {
            let mut ctrl = self.gate.ctrl.lock().unwrap();
            ctrl.exit_request = true;
            ctrl.transport = None;
            self.gate.cond.notify_all();
        }
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown();
        }
        self.shared.disconnect();
        if let Some(thread) = self.reader_thread.take() {
            let _ = thread.join();
        }
    }
}

/// Body of the reader thread: parked until a connect installs a transport,
/// reading until that stream ends, then parked again.
fn reader_task(
    gate: Arc<ReaderGate>,
    shared: Arc<SharedChannelState>,
    mut handler: Box<dyn UdsMessageHandler>,
    config: ReaderConfig,
) {
    let mut ctrl = gate.ctrl.lock().unwrap();
    loop {
        while !ctrl.running && !ctrl.exit_request {
            ctrl = gate.cond.wait(ctrl).unwrap();
        }
        if ctrl.exit_request {
            break;
        }
        let transport = ctrl.transport.take();
        // never hold the gate while blocked on I/O
        drop(ctrl);
        if let Some(mut transport) = transport {
            read_loop(transport.as_mut(), &shared, handler.as_mut(), &config);
            shared.disconnect();
            transport.shutdown();
        }
        ctrl = gate.ctrl.lock().unwrap();
        ctrl.running = false;
        gate.cond.notify_all();
    }
}

/// Frames messages off the stream and dispatches them until the stream ends
fn read_loop(
    transport: &mut dyn ByteStreamTransport,
    shared: &SharedChannelState,
    handler: &mut dyn UdsMessageHandler,
    config: &ReaderConfig,
) {
    let host_ip = transport
        .remote_addr()
        .map(|a| a.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    loop {
        let mut header_bytes = [0u8; DOIP_HEADER_LEN];
        if let Err(e) = transport.read_exact(&mut header_bytes) {
            log_read_end(&e);
            return;
        }
        let header = match DoipHeader::decode(&header_bytes, DOIP_MAX_PAYLOAD_LEN) {
            Ok(header) => header,
            Err(e) => {
                warn!("{e}; answering generic NACK");
                send_generic_nack(
                    transport,
                    config.protocol_version,
                    HeaderNackCode::IncorrectPatternFormat,
                );
                // the length field is still usable to stay frame aligned,
                // unless it is itself implausible
                let announced = u32::from_be_bytes([
                    header_bytes[4],
                    header_bytes[5],
                    header_bytes[6],
                    header_bytes[7],
                ]);
                if announced > config.max_payload_len || !drain(transport, announced) {
                    return;
                }
                continue;
            }
        };
        if header.protocol_version != config.protocol_version {
            warn!(
                "peer speaks protocol version 0x{:02X}, expected 0x{:02X}; answering generic NACK",
                header.protocol_version, config.protocol_version
            );
            send_generic_nack(
                transport,
                config.protocol_version,
                HeaderNackCode::IncorrectPatternFormat,
            );
            if !drain(transport, header.payload_length) {
                return;
            }
            continue;
        }
        let ceiling = match header.payload_type {
            PayloadType::DiagnosticMessage
            | PayloadType::DiagnosticMessagePositiveAck
            | PayloadType::DiagnosticMessageNegativeAck => config.max_payload_len,
            _ => CONTROL_PAYLOAD_CEILING,
        };
        if header.payload_length > ceiling {
            warn!(
                "payload of {} bytes exceeds ceiling of {ceiling}; answering generic NACK",
                header.payload_length
            );
            send_generic_nack(
                transport,
                config.protocol_version,
                HeaderNackCode::MessageTooLarge,
            );
            if !drain(transport, header.payload_length) {
                return;
            }
            continue;
        }
        let mut payload = vec![0u8; header.payload_length as usize];
        if let Err(e) = transport.read_exact(&mut payload) {
            log_read_end(&e);
            return;
        }
        match header.payload_type {
            PayloadType::RoutingActivationResponse => {
                process_routing_activation_response(shared, &payload);
            }
            PayloadType::DiagnosticMessage => {
                process_diagnostic_message(
                    shared,
                    handler,
                    &payload,
                    host_ip,
                    config.max_response_pending,
                );
            }
            PayloadType::DiagnosticMessagePositiveAck => process_positive_ack(shared, &payload),
            PayloadType::DiagnosticMessageNegativeAck => process_negative_ack(shared, &payload),
            PayloadType::GenericNack => match GenericNack::decode_payload(&payload) {
                Ok(nack) => warn!("gateway rejected a message: {:?}", nack.nack_code),
                Err(e) => warn!("dropping undecodable generic NACK: {e}"),
            },
            other => {
                warn!(
                    "{}; answering generic NACK",
                    CodecError::UnsupportedPayloadType(other.into())
                );
                send_generic_nack(
                    transport,
                    config.protocol_version,
                    HeaderNackCode::UnknownPayloadType,
                );
            }
        }
    }
}

fn send_generic_nack(transport: &mut dyn ByteStreamTransport, version: u8, code: HeaderNackCode) {
    let nack = GenericNack { nack_code: code };
    let frame = encode_frame(version, PayloadType::GenericNack, &nack.encode_payload());
    if let Err(e) = transport.send(&frame) {
        warn!("failed to send generic NACK: {e}");
    }
}

/// Reads and discards `len` payload bytes of a frame that was answered with a
/// NACK, keeping the stream frame aligned. Returns false when the stream
/// ended underneath.
fn drain(transport: &mut dyn ByteStreamTransport, len: u32) -> bool {
    let mut chunk = [0u8; 1024];
    let mut remaining = len as usize;
    while remaining > 0 {
        let take = remaining.min(chunk.len());
        if let Err(e) = transport.read_exact(&mut chunk[..take]) {
            log_read_end(&e);
            return false;
        }
        remaining -= take;
    }
    true
}

fn log_read_end(err: &TransportError) {
    match err {
        TransportError::Eof => debug!("remote closed the connection"),
        e => error!("read failed: {e}"),
    }
}
