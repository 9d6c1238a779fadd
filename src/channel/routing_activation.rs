//! Routing activation handshake handler
//!
//! DoIP gateways only route diagnostic traffic for a logical source address
//! after that address has been activated on the TCP connection. This handler
//! runs the activation sub-state machine: it writes the activation request,
//! parks the caller on the channel rendezvous, and is completed by the reader
//! task when the activation response (payload type `0x0006`) arrives.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::codec::{
    encode_frame, ActivationType, PayloadType, RoutingActivationRequest,
    RoutingActivationResponse, RoutingActivationResponseCode,
};
use crate::transport::ByteStreamTransport;
use crate::uds::RoutingActivationResult;

use super::{ConnectionState, RoutingActivationState, SharedChannelState};

pub(crate) struct RoutingActivationHandler {
    shared: Arc<SharedChannelState>,
    timeout: Duration,
    protocol_version: u8,
}

impl RoutingActivationHandler {
    pub fn new(shared: Arc<SharedChannelState>, timeout: Duration, protocol_version: u8) -> Self {
        Self {
            shared,
            timeout,
            protocol_version,
        }
    }

    /// Sends a routing activation request for `source_address` and blocks
    /// until the gateway answers, the timeout expires or the channel
    /// disconnects. Called on the UDS-layer thread; `writer` is the channel's
    /// write half.
    pub fn activate(
        &self,
        writer: &mut dyn ByteStreamTransport,
        source_address: u16,
        activation_type: ActivationType,
    ) -> RoutingActivationResult {
        {
            let mut state = self.shared.lock();
            if state.connection != ConnectionState::Connected {
                warn!("routing activation requested without a connection");
                return RoutingActivationResult::Failed;
            }
            if state.routing == RoutingActivationState::WaitForRoutingActivationRes {
                warn!("routing activation already outstanding");
                return RoutingActivationResult::Failed;
            }
            // waiting state is entered before the frame is written so a
            // response racing the send is not dropped
            state.routing = RoutingActivationState::WaitForRoutingActivationRes;
            state.routing_response = None;
        }

        let request = RoutingActivationRequest::new(source_address, activation_type);
        let frame = encode_frame(
            self.protocol_version,
            PayloadType::RoutingActivationRequest,
            &request.encode_payload(),
        );
        if let Err(e) = writer.send(&frame) {
            warn!("failed to write routing activation request: {e}");
            self.shared.lock().routing = RoutingActivationState::RoutingActivationFailed;
            return RoutingActivationResult::Failed;
        }
        debug!("routing activation requested for source address 0x{source_address:04X}");

        let deadline = Instant::now() + self.timeout;
        let mut state = self.shared.lock();
        loop {
            if state.connection != ConnectionState::Connected {
                return RoutingActivationResult::Canceled;
            }
            match state.routing {
                RoutingActivationState::RoutingActivationSuccessful => {
                    return RoutingActivationResult::Successful;
                }
                RoutingActivationState::RoutingActivationFailed => {
                    return RoutingActivationResult::Failed;
                }
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("routing activation timed out");
                state.routing = RoutingActivationState::RoutingActivationFailed;
                return RoutingActivationResult::Failed;
            }
            state = self.shared.wait_timeout(state, deadline - now);
        }
    }
}

/// Processes a routing activation response frame. Runs on the reader task.
pub(crate) fn process_routing_activation_response(shared: &SharedChannelState, payload: &[u8]) {
    let response = match RoutingActivationResponse::decode_payload(payload) {
        Ok(response) => response,
        Err(e) => {
            warn!("dropping undecodable routing activation response: {e}");
            return;
        }
    };
    let mut state = shared.lock();
    if state.routing != RoutingActivationState::WaitForRoutingActivationRes {
        debug!(
            "dropping routing activation response in state {:?}",
            state.routing
        );
        return;
    }
    state.routing =
        if response.response_code == RoutingActivationResponseCode::SuccessfullyActivated {
            debug!(
                "routing activated by entity 0x{:04X}",
                response.entity_address
            );
            RoutingActivationState::RoutingActivationSuccessful
        } else {
            warn!(
                "routing activation rejected: {:?}",
                response.response_code
            );
            RoutingActivationState::RoutingActivationFailed
        };
    state.routing_response = Some(response);
    shared.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportError, TransportResult};
    use std::net::SocketAddr;

    struct StubWriter {
        frames: Vec<Vec<u8>>,
    }

    impl ByteStreamTransport for StubWriter {
        fn open(&mut self, _local: Option<SocketAddr>) -> TransportResult<()> {
            Ok(())
        }
        fn connect(&mut self, _remote: SocketAddr) -> TransportResult<()> {
            Ok(())
        }
        fn send(&mut self, bytes: &[u8]) -> TransportResult<()> {
            self.frames.push(bytes.to_vec());
            Ok(())
        }
        fn read_exact(&mut self, _buf: &mut [u8]) -> TransportResult<()> {
            Err(TransportError::Eof)
        }
        fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> TransportResult<()> {
            Ok(())
        }
        fn shutdown(&mut self) {}
        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn clone_stream(&self) -> Box<dyn ByteStreamTransport> {
            Box::new(StubWriter { frames: Vec::new() })
        }
    }

    fn connected_shared() -> Arc<SharedChannelState> {
        let shared = Arc::new(SharedChannelState::new());
        shared.lock().connection = ConnectionState::Connected;
        shared
    }

    fn response_payload(code: RoutingActivationResponseCode) -> Vec<u8> {
        RoutingActivationResponse {
            client_address: 0x0E80,
            entity_address: 0x1234,
            response_code: code,
            reserved: [0u8; 4],
            reserved_oem: [0u8; 4],
            oem_specific: None,
        }
        .encode_payload()
    }

    #[test]
    fn activation_times_out_as_failed() {
        let shared = connected_shared();
        let handler =
            RoutingActivationHandler::new(shared.clone(), Duration::from_millis(100), 0x02);
        let mut writer = StubWriter { frames: Vec::new() };
        let res = handler.activate(&mut writer, 0x0E80, ActivationType::Default);
        assert_eq!(res, RoutingActivationResult::Failed);
        assert_eq!(
            shared.lock().routing,
            RoutingActivationState::RoutingActivationFailed
        );
        // the request frame went out exactly once
        assert_eq!(writer.frames.len(), 1);
        assert_eq!(&writer.frames[0][2..4], &[0x00, 0x05]);
    }

    #[test]
    fn success_response_completes_activation() {
        let shared = connected_shared();
        let reader_shared = shared.clone();
        let reader = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            process_routing_activation_response(
                &reader_shared,
                &response_payload(RoutingActivationResponseCode::SuccessfullyActivated),
            );
        });
        let handler =
            RoutingActivationHandler::new(shared.clone(), Duration::from_millis(500), 0x02);
        let mut writer = StubWriter { frames: Vec::new() };
        let res = handler.activate(&mut writer, 0x0E80, ActivationType::Default);
        reader.join().unwrap();
        assert_eq!(res, RoutingActivationResult::Successful);
        assert_eq!(
            shared.lock().routing,
            RoutingActivationState::RoutingActivationSuccessful
        );
        let response = shared.lock().routing_response.clone().unwrap();
        assert_eq!(response.entity_address, 0x1234);
    }

    #[test]
    fn response_while_idle_is_dropped() {
        let shared = connected_shared();
        process_routing_activation_response(
            &shared,
            &response_payload(RoutingActivationResponseCode::SuccessfullyActivated),
        );
        let state = shared.lock();
        assert_eq!(state.routing, RoutingActivationState::Idle);
        assert!(state.routing_response.is_none());
    }
}
