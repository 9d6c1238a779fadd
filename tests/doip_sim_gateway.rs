//! End-to-end tests driving a simulated DoIP gateway through the client
//! façade. The gateway lives behind the byte-stream transport trait and
//! answers each frame it receives according to a per-test script.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use doip_client::codec::{
    encode_frame, DiagnosticMessage, DiagnosticMessagePositiveAck, DoipHeader, PayloadType,
    RoutingActivationRequest, RoutingActivationResponse, RoutingActivationResponseCode,
    ActivationType, DOIP_HEADER_LEN, DOIP_MAX_PAYLOAD_LEN,
};
use doip_client::transport::{ByteStreamTransport, TransportError, TransportResult};
use doip_client::uds::{
    ConnectionResult, IndicationResult, RoutingActivationResult, TargetAddressType,
    TransmissionResult, UdsMessage, UdsMessageHandler,
};
use doip_client::{DoipClient, DoipClientOptions};

const GATEWAY_ADDR: &str = "192.168.1.20:13400";
const TESTER_ADDR: u16 = 0x0E80;
const GATEWAY_LOGICAL_ADDR: u16 = 0x1234;
const ECU_ADDR: u16 = 0x0001;

type Script = Box<dyn FnMut(&DoipHeader, &[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct RxBuffer {
    data: VecDeque<u8>,
    closed: bool,
}

struct GatewayInner {
    rx: Mutex<RxBuffer>,
    cond: Condvar,
    script: Mutex<Script>,
    received: Mutex<Vec<(u16, Vec<u8>)>>,
}

/// In-memory gateway: frames the client writes are answered by the script,
/// frames the script produces are queued for the client's reader.
#[derive(Clone)]
struct SimGatewayTransport {
    inner: Arc<GatewayInner>,
}

impl SimGatewayTransport {
    fn new(script: impl FnMut(&DoipHeader, &[u8]) -> Vec<Vec<u8>> + Send + 'static) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                rx: Mutex::new(RxBuffer::default()),
                cond: Condvar::new(),
                script: Mutex::new(Box::new(script)),
                received: Mutex::new(Vec::new()),
            }),
        }
    }

    fn push_raw(&self, bytes: &[u8]) {
        let mut rx = self.inner.rx.lock().unwrap();
        rx.data.extend(bytes);
        self.inner.cond.notify_all();
    }

    fn close(&self) {
        self.inner.rx.lock().unwrap().closed = true;
        self.inner.cond.notify_all();
    }

    /// Frames the client has sent so far, as (payload type, payload) pairs
    fn received(&self) -> Vec<(u16, Vec<u8>)> {
        self.inner.received.lock().unwrap().clone()
    }
}

impl ByteStreamTransport for SimGatewayTransport {
    fn open(&mut self, _local: Option<SocketAddr>) -> TransportResult<()> {
        Ok(())
    }

    fn connect(&mut self, _remote: SocketAddr) -> TransportResult<()> {
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> TransportResult<()> {
        let mut header_bytes = [0u8; DOIP_HEADER_LEN];
        header_bytes.copy_from_slice(&bytes[..DOIP_HEADER_LEN]);
        let header = DoipHeader::decode(&header_bytes, DOIP_MAX_PAYLOAD_LEN).unwrap();
        let payload = &bytes[DOIP_HEADER_LEN..];
        self.inner
            .received
            .lock()
            .unwrap()
            .push((header.payload_type.into(), payload.to_vec()));
        let responses = {
            let mut script = self.inner.script.lock().unwrap();
            (*script)(&header, payload)
        };
        if !responses.is_empty() {
            let mut rx = self.inner.rx.lock().unwrap();
            for frame in responses {
                rx.data.extend(frame);
            }
            self.inner.cond.notify_all();
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> TransportResult<()> {
        let mut rx = self.inner.rx.lock().unwrap();
        loop {
            if rx.data.len() >= buf.len() {
                for slot in buf.iter_mut() {
                    *slot = rx.data.pop_front().unwrap();
                }
                return Ok(());
            }
            if rx.closed {
                return Err(TransportError::Eof);
            }
            let (guard, timeout) = self
                .inner
                .cond
                .wait_timeout(rx, Duration::from_secs(5))
                .unwrap();
            rx = guard;
            // fail fast instead of hanging a broken test
            if timeout.timed_out() {
                return Err(TransportError::Eof);
            }
        }
    }

    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> TransportResult<()> {
        Ok(())
    }

    fn shutdown(&mut self) {
        self.close();
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(GATEWAY_ADDR.parse().unwrap())
    }

    fn clone_stream(&self) -> Box<dyn ByteStreamTransport> {
        Box::new(self.clone())
    }
}

#[derive(Clone, Default)]
struct RecordingHandler {
    messages: Arc<Mutex<Vec<UdsMessage>>>,
    indications: Arc<Mutex<Vec<usize>>>,
}

impl UdsMessageHandler for RecordingHandler {
    fn indicate_message(
        &mut self,
        _source_address: u16,
        _target_address: u16,
        _target_address_type: TargetAddressType,
        size: usize,
        _host_ip: IpAddr,
    ) -> IndicationResult {
        self.indications.lock().unwrap().push(size);
        IndicationResult::Ok
    }

    fn handle_message(&mut self, message: UdsMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_options() -> DoipClientOptions {
    DoipClientOptions {
        routing_activation_timeout: Duration::from_millis(300),
        diagnostic_ack_timeout: Duration::from_millis(300),
        diagnostic_response_timeout: Duration::from_millis(300),
        ..DoipClientOptions::default()
    }
}

fn connected_client(
    options: DoipClientOptions,
    handler: RecordingHandler,
    gateway: &SimGatewayTransport,
) -> DoipClient {
    let mut client = DoipClient::new(options, Box::new(handler));
    let result =
        client.connect_to_host_with(Box::new(gateway.clone()), GATEWAY_ADDR.parse().unwrap());
    assert_eq!(result, ConnectionResult::Connected);
    client
}

fn activation_response_frame(code: RoutingActivationResponseCode) -> Vec<u8> {
    let response = RoutingActivationResponse {
        client_address: TESTER_ADDR,
        entity_address: GATEWAY_LOGICAL_ADDR,
        response_code: code,
        reserved: [0u8; 4],
        reserved_oem: [0u8; 4],
        oem_specific: None,
    };
    encode_frame(
        0x02,
        PayloadType::RoutingActivationResponse,
        &response.encode_payload(),
    )
}

fn positive_ack_frame() -> Vec<u8> {
    let ack = DiagnosticMessagePositiveAck {
        source_address: GATEWAY_LOGICAL_ADDR,
        target_address: TESTER_ADDR,
        ack_code: 0x00,
        previous_message: Vec::new(),
    };
    encode_frame(
        0x02,
        PayloadType::DiagnosticMessagePositiveAck,
        &ack.encode_payload(),
    )
}

fn diag_frame(user_data: &[u8]) -> Vec<u8> {
    let msg = DiagnosticMessage {
        source_address: ECU_ADDR,
        target_address: TESTER_ADDR,
        user_data: user_data.to_vec(),
    };
    encode_frame(0x02, PayloadType::DiagnosticMessage, &msg.encode_payload())
}

fn read_request() -> UdsMessage {
    UdsMessage {
        source_address: TESTER_ADDR,
        target_address: ECU_ADDR,
        target_address_type: TargetAddressType::Physical,
        host_ip: "192.168.1.20".parse().unwrap(),
        payload: vec![0x22, 0xF1, 0x90],
    }
}

#[test]
fn successful_routing_activation() {
    init_logging();
    let gateway = SimGatewayTransport::new(|header, payload| {
        if header.payload_type == PayloadType::RoutingActivationRequest {
            let request = RoutingActivationRequest::decode_payload(payload).unwrap();
            assert_eq!(request.source_address, TESTER_ADDR);
            assert_eq!(request.activation_type, ActivationType::Default);
            return vec![activation_response_frame(
                RoutingActivationResponseCode::SuccessfullyActivated,
            )];
        }
        Vec::new()
    });
    let mut client = connected_client(fast_options(), RecordingHandler::default(), &gateway);

    assert!(!client.is_routing_activated());
    let result = client.activate_routing(TESTER_ADDR, ActivationType::Default);
    assert_eq!(result, RoutingActivationResult::Successful);
    assert!(client.is_routing_activated());
}

#[test]
fn rejected_routing_activation_blocks_diagnostics() {
    init_logging();
    let gateway = SimGatewayTransport::new(|header, _payload| {
        if header.payload_type == PayloadType::RoutingActivationRequest {
            return vec![activation_response_frame(
                RoutingActivationResponseCode::DeniedUnsupportedActivationType,
            )];
        }
        Vec::new()
    });
    let mut client = connected_client(fast_options(), RecordingHandler::default(), &gateway);

    let result = client.activate_routing(TESTER_ADDR, ActivationType::Default);
    assert_eq!(result, RoutingActivationResult::Failed);
    assert!(!client.is_routing_activated());

    // no diagnostic traffic is permitted on a channel without routing
    let result = client.transmit(&read_request());
    assert_eq!(result, TransmissionResult::TransmitFailed);
    assert!(gateway
        .received()
        .iter()
        .all(|(ty, _)| *ty != u16::from(PayloadType::DiagnosticMessage)));
}

#[test]
fn response_pending_loop_delivers_final_response() {
    init_logging();
    let mut final_response = vec![0x62, 0xF1, 0x90];
    final_response.extend_from_slice(b"WDB9634031L123456");
    assert_eq!(final_response.len(), 20);
    let final_clone = final_response.clone();

    let gateway = SimGatewayTransport::new(move |header, _payload| match header.payload_type {
        PayloadType::RoutingActivationRequest => vec![activation_response_frame(
            RoutingActivationResponseCode::SuccessfullyActivated,
        )],
        PayloadType::DiagnosticMessage => vec![
            positive_ack_frame(),
            diag_frame(&[0x7F, 0x22, 0x78]),
            diag_frame(&[0x7F, 0x22, 0x78]),
            diag_frame(&[0x7F, 0x22, 0x78]),
            diag_frame(&final_clone),
        ],
        _ => Vec::new(),
    });
    let handler = RecordingHandler::default();
    let messages = handler.messages.clone();
    let indications = handler.indications.clone();
    let mut client = connected_client(fast_options(), handler, &gateway);

    assert_eq!(
        client.activate_routing(TESTER_ADDR, ActivationType::Default),
        RoutingActivationResult::Successful
    );
    assert_eq!(client.transmit(&read_request()), TransmissionResult::TransmitOk);

    let messages = messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload, final_response);
    assert_eq!(messages[0].source_address, ECU_ADDR);
    assert_eq!(messages[0].target_address, TESTER_ADDR);
    assert_eq!(indications.lock().unwrap().as_slice(), &[20]);
}

#[test]
fn ack_timeout_returns_channel_to_idle() {
    init_logging();
    let gateway = SimGatewayTransport::new(|header, _payload| {
        if header.payload_type == PayloadType::RoutingActivationRequest {
            return vec![activation_response_frame(
                RoutingActivationResponseCode::SuccessfullyActivated,
            )];
        }
        // never acknowledge diagnostic requests
        Vec::new()
    });
    let mut client = connected_client(fast_options(), RecordingHandler::default(), &gateway);

    assert_eq!(
        client.activate_routing(TESTER_ADDR, ActivationType::Default),
        RoutingActivationResult::Successful
    );
    assert_eq!(
        client.transmit(&read_request()),
        TransmissionResult::NoResponseReceived
    );
    // the sub-state returned to idle: a new request is accepted, not busy
    assert_eq!(
        client.transmit(&read_request()),
        TransmissionResult::NoResponseReceived
    );
}

#[test]
fn response_pending_overflow_surfaces() {
    init_logging();
    let gateway = SimGatewayTransport::new(|header, _payload| match header.payload_type {
        PayloadType::RoutingActivationRequest => vec![activation_response_frame(
            RoutingActivationResponseCode::SuccessfullyActivated,
        )],
        PayloadType::DiagnosticMessage => vec![
            positive_ack_frame(),
            diag_frame(&[0x7F, 0x22, 0x78]),
            diag_frame(&[0x7F, 0x22, 0x78]),
            diag_frame(&[0x7F, 0x22, 0x78]),
        ],
        _ => Vec::new(),
    });
    let options = DoipClientOptions {
        max_response_pending: 2,
        ..fast_options()
    };
    let mut client = connected_client(options, RecordingHandler::default(), &gateway);

    assert_eq!(
        client.activate_routing(TESTER_ADDR, ActivationType::Default),
        RoutingActivationResult::Successful
    );
    assert_eq!(
        client.transmit(&read_request()),
        TransmissionResult::ResponsePendingOverflow
    );
}

#[test]
fn mismatched_header_version_answered_with_nack() {
    init_logging();
    let gateway = SimGatewayTransport::new(|header, payload| {
        match header.payload_type {
            PayloadType::RoutingActivationRequest => {
                // answer with a protocol version the client does not speak
                vec![vec![0x01, 0xFE, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]]
            }
            PayloadType::GenericNack => {
                // the client objected as expected; now answer properly
                assert_eq!(payload, [0x00]);
                vec![activation_response_frame(
                    RoutingActivationResponseCode::SuccessfullyActivated,
                )]
            }
            _ => Vec::new(),
        }
    });
    let mut client = connected_client(fast_options(), RecordingHandler::default(), &gateway);

    // the reader keeps going after the bad frame, so activation still succeeds
    assert_eq!(
        client.activate_routing(TESTER_ADDR, ActivationType::Default),
        RoutingActivationResult::Successful
    );
    let nacks: Vec<_> = gateway
        .received()
        .into_iter()
        .filter(|(ty, _)| *ty == u16::from(PayloadType::GenericNack))
        .collect();
    assert_eq!(nacks.len(), 1);
    assert_eq!(nacks[0].1, vec![0x00]);
}

#[test]
fn peer_eof_cancels_outstanding_request() {
    init_logging();
    let gateway = SimGatewayTransport::new(|_header, _payload| Vec::new());
    let mut client = connected_client(fast_options(), RecordingHandler::default(), &gateway);

    let half_close = {
        let gateway = gateway.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            // six header bytes, then the connection dies
            gateway.push_raw(&[0x02, 0xFD, 0x00, 0x06, 0x00, 0x00]);
            gateway.close();
        })
    };
    let result = client.activate_routing(TESTER_ADDR, ActivationType::Default);
    half_close.join().unwrap();

    assert_eq!(result, RoutingActivationResult::Canceled);
    assert!(!client.is_connected());
    assert_eq!(client.transmit(&read_request()), TransmissionResult::TransmitFailed);
}
