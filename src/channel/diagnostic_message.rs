//! Diagnostic request/response handler
//!
//! One diagnostic request at a time travels through this sub-state machine:
//! the request frame is written, the gateway acknowledges it (`0x8002` /
//! `0x8003`) within the ack timeout, and the ECU's response (`0x8001`)
//! arrives within the response timeout. A UDS negative response with NRC
//! `0x78` (request correctly received, response pending) restarts the
//! response timer, bounded by a ceiling on consecutive pending frames, so
//! long-running ECU operations do not starve the caller forever.
//!
//! The transmit side runs on the UDS-layer thread and parks on the channel
//! rendezvous; the `process_*` functions run on the reader task and complete
//! it.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use automotive_diag::uds::{UdsError, UdsErrorByte};
use automotive_diag::ByteWrapper::Standard;
use log::{debug, warn};

use crate::codec::{
    encode_frame, DiagnosticMessage, DiagnosticMessageNegativeAck, DiagnosticMessagePositiveAck,
    PayloadType,
};
use crate::transport::ByteStreamTransport;
use crate::uds::{IndicationResult, TargetAddressType, TransmissionResult, UdsMessage};

use super::{
    ConnectionState, DiagnosticMessageState, DiagnosticOutcome, RoutingActivationState,
    SharedChannelState,
};

/// Service identifier of a UDS negative response
const UDS_NEGATIVE_RESPONSE_SID: u8 = 0x7F;

pub(crate) struct DiagnosticMessageHandler {
    shared: Arc<SharedChannelState>,
    ack_timeout: Duration,
    response_timeout: Duration,
    protocol_version: u8,
}

impl DiagnosticMessageHandler {
    pub fn new(
        shared: Arc<SharedChannelState>,
        ack_timeout: Duration,
        response_timeout: Duration,
        protocol_version: u8,
    ) -> Self {
        Self {
            shared,
            ack_timeout,
            response_timeout,
            protocol_version,
        }
    }

    /// Writes one diagnostic request and blocks until the exchange concludes:
    /// acknowledgement, response-pending sequence and final response (which
    /// the reader task delivers through the UDS handler callbacks before this
    /// returns), or a timeout, rejection or disconnect along the way.
    pub fn transmit(
        &self,
        writer: &mut dyn ByteStreamTransport,
        message: &UdsMessage,
    ) -> TransmissionResult {
        {
            let mut state = self.shared.lock();
            if state.connection != ConnectionState::Connected {
                warn!("diagnostic transmission without a connection");
                return TransmissionResult::TransmitFailed;
            }
            if state.routing != RoutingActivationState::RoutingActivationSuccessful {
                warn!("diagnostic transmission before routing activation");
                return TransmissionResult::TransmitFailed;
            }
            if state.diagnostic != DiagnosticMessageState::Idle {
                return TransmissionResult::BusyProcessing;
            }
            // the machine leaves idle before the frame is written so an ack
            // racing the send is not dropped
            state.diagnostic = DiagnosticMessageState::SendDiagnosticReqFrame;
            state.diagnostic_outcome = None;
            state.pending_count = 0;
        }

        let request = DiagnosticMessage {
            source_address: message.source_address,
            target_address: message.target_address,
            user_data: message.payload.clone(),
        };
        let frame = encode_frame(
            self.protocol_version,
            PayloadType::DiagnosticMessage,
            &request.encode_payload(),
        );
        if let Err(e) = writer.send(&frame) {
            warn!("failed to write diagnostic request: {e}");
            self.shared.lock().diagnostic = DiagnosticMessageState::Idle;
            return TransmissionResult::TransmitFailed;
        }
        debug!(
            "diagnostic request 0x{:04X} -> 0x{:04X} sent ({} bytes)",
            message.source_address,
            message.target_address,
            message.payload.len()
        );

        let mut state = self.shared.lock();
        if state.diagnostic == DiagnosticMessageState::SendDiagnosticReqFrame {
            state.diagnostic = DiagnosticMessageState::WaitForDiagnosticAck;
        }

        // acknowledgement phase
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            if state.connection != ConnectionState::Connected {
                state.diagnostic = DiagnosticMessageState::Idle;
                return TransmissionResult::Canceled;
            }
            if let Some(outcome) = state.diagnostic_outcome.take() {
                return outcome_result(outcome);
            }
            if state.diagnostic != DiagnosticMessageState::WaitForDiagnosticAck {
                // the reader advanced the machine past the ack
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("diagnostic acknowledgement timed out");
                state.diagnostic = DiagnosticMessageState::Idle;
                return TransmissionResult::NoResponseReceived;
            }
            state = self.shared.wait_timeout(state, deadline - now);
        }

        // response phase; each response-pending frame restarts the clock
        let mut deadline = Instant::now() + self.response_timeout;
        let mut seen_pending = 0u8;
        loop {
            if state.connection != ConnectionState::Connected {
                state.diagnostic = DiagnosticMessageState::Idle;
                return TransmissionResult::Canceled;
            }
            if let Some(outcome) = state.diagnostic_outcome.take() {
                return outcome_result(outcome);
            }
            if state.pending_count > seen_pending {
                seen_pending = state.pending_count;
                deadline = Instant::now() + self.response_timeout;
            }
            let now = Instant::now();
            if now >= deadline {
                if state.diagnostic == DiagnosticMessageState::DiagnosticFinalResRecvd {
                    // the final response is already being delivered; let the
                    // reader finish instead of reporting a timeout
                    state = self.shared.wait_timeout(state, Duration::from_millis(10));
                    continue;
                }
                warn!("diagnostic response timed out");
                state.diagnostic = DiagnosticMessageState::Idle;
                return TransmissionResult::NoResponseReceived;
            }
            state = self.shared.wait_timeout(state, deadline - now);
        }
    }
}

fn outcome_result(outcome: DiagnosticOutcome) -> TransmissionResult {
    match outcome {
        DiagnosticOutcome::NegativeAck(code) => TransmissionResult::NegAckReceived(code),
        DiagnosticOutcome::FinalResponseDelivered => TransmissionResult::TransmitOk,
        DiagnosticOutcome::ResponsePendingOverflow => TransmissionResult::ResponsePendingOverflow,
    }
}

fn is_response_pending(user_data: &[u8]) -> bool {
    user_data.first() == Some(&UDS_NEGATIVE_RESPONSE_SID)
        && matches!(
            user_data.get(2).map(|&nrc| UdsErrorByte::from(nrc)),
            Some(Standard(UdsError::RequestCorrectlyReceivedResponsePending))
        )
}

/// Processes a diagnostic message positive acknowledge. Runs on the reader
/// task.
pub(crate) fn process_positive_ack(shared: &SharedChannelState, payload: &[u8]) {
    let ack = match DiagnosticMessagePositiveAck::decode_payload(payload) {
        Ok(ack) => ack,
        Err(e) => {
            warn!("dropping undecodable diagnostic positive ack: {e}");
            return;
        }
    };
    let mut state = shared.lock();
    match state.diagnostic {
        DiagnosticMessageState::SendDiagnosticReqFrame
        | DiagnosticMessageState::WaitForDiagnosticAck => {
            state.diagnostic = DiagnosticMessageState::DiagnosticPositiveAckRecvd;
            debug!("diagnostic request acked by 0x{:04X}", ack.source_address);
            // the ack state is transient; the response wait begins immediately
            state.diagnostic = DiagnosticMessageState::WaitForDiagnosticResponse;
            shared.notify_all();
        }
        _ => debug!(
            "dropping diagnostic positive ack in state {:?}",
            state.diagnostic
        ),
    }
}

/// Processes a diagnostic message negative acknowledge. Runs on the reader
/// task.
pub(crate) fn process_negative_ack(shared: &SharedChannelState, payload: &[u8]) {
    let nack = match DiagnosticMessageNegativeAck::decode_payload(payload) {
        Ok(nack) => nack,
        Err(e) => {
            warn!("dropping undecodable diagnostic negative ack: {e}");
            return;
        }
    };
    let mut state = shared.lock();
    match state.diagnostic {
        DiagnosticMessageState::SendDiagnosticReqFrame
        | DiagnosticMessageState::WaitForDiagnosticAck => {
            warn!("diagnostic request rejected: {:?}", nack.nack_code);
            state.diagnostic = DiagnosticMessageState::Idle;
            state.diagnostic_outcome = Some(DiagnosticOutcome::NegativeAck(nack.nack_code));
            shared.notify_all();
        }
        _ => debug!(
            "dropping diagnostic negative ack in state {:?}",
            state.diagnostic
        ),
    }
}

/// Processes an incoming diagnostic message. Runs on the reader task; final
/// responses are handed to the UDS layer through `handler` with the state
/// mutex released.
pub(crate) fn process_diagnostic_message(
    shared: &SharedChannelState,
    handler: &mut dyn crate::uds::UdsMessageHandler,
    payload: &[u8],
    host_ip: IpAddr,
    max_response_pending: u8,
) {
    let msg = match DiagnosticMessage::decode_payload(payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("dropping undecodable diagnostic message: {e}");
            return;
        }
    };
    {
        let mut state = shared.lock();
        if state.diagnostic != DiagnosticMessageState::WaitForDiagnosticResponse {
            warn!(
                "dropping unsolicited diagnostic message from 0x{:04X}",
                msg.source_address
            );
            return;
        }
        if is_response_pending(&msg.user_data) {
            state.pending_count = state.pending_count.saturating_add(1);
            debug!(
                "response pending from 0x{:04X} ({} so far)",
                msg.source_address, state.pending_count
            );
            if state.pending_count > max_response_pending {
                warn!(
                    "more than {max_response_pending} consecutive response-pending frames, giving up"
                );
                state.diagnostic = DiagnosticMessageState::Idle;
                state.diagnostic_outcome = Some(DiagnosticOutcome::ResponsePendingOverflow);
            }
            shared.notify_all();
            return;
        }
        state.diagnostic = DiagnosticMessageState::DiagnosticFinalResRecvd;
    }

    // deliver with the mutex released; the indication may copy or allocate
    let size = msg.user_data.len();
    let indication = handler.indicate_message(
        msg.source_address,
        msg.target_address,
        TargetAddressType::Physical,
        size,
        host_ip,
    );
    match indication {
        IndicationResult::Ok => handler.handle_message(UdsMessage {
            source_address: msg.source_address,
            target_address: msg.target_address,
            target_address_type: TargetAddressType::Physical,
            host_ip,
            payload: msg.user_data,
        }),
        other => warn!("UDS layer refused indication ({other:?}), response dropped"),
    }

    let mut state = shared.lock();
    state.diagnostic = DiagnosticMessageState::Idle;
    state.diagnostic_outcome = Some(DiagnosticOutcome::FinalResponseDelivered);
    shared.notify_all();
}
