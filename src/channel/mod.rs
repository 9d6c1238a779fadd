//! DoIP communication channels
//!
//! A [tcp_channel::DoipTcpChannel] carries routing activation and diagnostic
//! traffic over one TCP (or TLS) connection; a
//! [udp_channel::DoipUdpChannel] performs vehicle discovery over UDP.
//!
//! The TCP channel superimposes three sub-state machines on one connection:
//! connect/disconnect, routing activation, and diagnostic request/response.
//! All three live behind a single mutex, together with the condition
//! variable that wakes the UDS-layer thread waiting on an outstanding
//! request, so state transitions and wakeups are atomic.

pub mod diagnostic_message;
pub mod routing_activation;
pub mod tcp_channel;
pub mod udp_channel;

use std::sync::{Condvar, Mutex, MutexGuard};

use crate::codec::{DiagnosticNackCode, RoutingActivationResponse};

/// Ceiling for control payloads (everything except diagnostic messages and
/// their acks); routing activation and discovery payloads are tiny
pub(crate) const CONTROL_PAYLOAD_CEILING: u32 = 1024;

/// Connection sub-state of a TCP channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet connected
    Idle,
    /// Connected; the reader task is running
    Connected,
    /// Disconnected, locally or by the peer
    Disconnected,
}

/// Routing activation sub-state of a TCP channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RoutingActivationState {
    /// No activation requested
    Idle,
    /// Activation request written, waiting for the response
    WaitForRoutingActivationRes,
    /// Gateway activated routing; diagnostic traffic is permitted
    RoutingActivationSuccessful,
    /// Gateway rejected the activation or the response timed out
    RoutingActivationFailed,
}

/// Diagnostic message sub-state of a TCP channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiagnosticMessageState {
    /// No request outstanding
    Idle,
    /// Request frame is being written
    SendDiagnosticReqFrame,
    /// Request written, waiting for the gateway's acknowledgement
    WaitForDiagnosticAck,
    /// Positive acknowledgement received
    DiagnosticPositiveAckRecvd,
    /// Waiting for the ECU's response
    WaitForDiagnosticResponse,
    /// Final response received and being delivered
    DiagnosticFinalResRecvd,
}

/// Terminal event of one diagnostic request, produced by the reader task and
/// consumed by the waiting transmit call
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DiagnosticOutcome {
    /// Gateway rejected the request with this code
    NegativeAck(DiagnosticNackCode),
    /// Final response was delivered to the UDS layer
    FinalResponseDelivered,
    /// The ECU exceeded the response-pending ceiling
    ResponsePendingOverflow,
}

/// All sub-states of one TCP channel plus the rendezvous slots between the
/// reader task and the UDS-layer thread
#[derive(Debug)]
pub(crate) struct ChannelState {
    pub connection: ConnectionState,
    pub routing: RoutingActivationState,
    pub diagnostic: DiagnosticMessageState,
    /// Response that resolved the last routing activation
    pub routing_response: Option<RoutingActivationResponse>,
    /// Terminal event of the outstanding diagnostic request
    pub diagnostic_outcome: Option<DiagnosticOutcome>,
    /// Consecutive response-pending frames seen for the outstanding request
    pub pending_count: u8,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            connection: ConnectionState::Idle,
            routing: RoutingActivationState::Idle,
            diagnostic: DiagnosticMessageState::Idle,
            routing_response: None,
            diagnostic_outcome: None,
            pending_count: 0,
        }
    }
}

/// The mutex/condvar pair guarding [ChannelState], shared by the channel, its
/// sub-handlers and the reader task
#[derive(Debug)]
pub(crate) struct SharedChannelState {
    state: Mutex<ChannelState>,
    notify: Condvar,
}

impl SharedChannelState {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState::new()),
            notify: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap()
    }

    pub fn notify_all(&self) {
        self.notify.notify_all();
    }

    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, ChannelState>,
        timeout: std::time::Duration,
    ) -> MutexGuard<'a, ChannelState> {
        self.notify.wait_timeout(guard, timeout).unwrap().0
    }

    /// Marks the channel disconnected and wakes every waiter, which then
    /// observes the cancellation on its own thread.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.connection = ConnectionState::Disconnected;
        self.notify.notify_all();
    }
}
