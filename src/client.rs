//! The client façade presented to the UDS transport layer
//!
//! [DoipClient] bundles one TCP channel to a gateway behind the small surface
//! the UDS layer drives: connect, activate routing, transmit, disconnect.
//! Incoming diagnostic responses flow back through the
//! [crate::uds::UdsMessageHandler] supplied at construction.

use std::net::SocketAddr;
use std::time::Duration;

use crate::channel::tcp_channel::DoipTcpChannel;
use crate::channel::ConnectionState;
use crate::codec::{ActivationType, PROTOCOL_VERSION_ISO_13400_2_2012};
use crate::transport::{ByteStreamTransport, TcpTransport};
use crate::uds::{
    ConnectionResult, DisconnectionResult, RoutingActivationResult, TransmissionResult,
    UdsMessage, UdsMessageHandler,
};

use log::error;

/// Configuration of a [DoipClient]
#[derive(Clone)]
pub struct DoipClientOptions {
    /// Bounds every read of the channel's reader task. `None` blocks until
    /// data arrives; a timeout tears the connection down when it expires.
    pub tcp_read_timeout: Option<Duration>,
    /// How long to wait for the routing activation response
    pub routing_activation_timeout: Duration,
    /// How long to wait for the gateway's diagnostic acknowledgement
    pub diagnostic_ack_timeout: Duration,
    /// How long to wait for the ECU's response; restarted by every
    /// response-pending frame
    pub diagnostic_response_timeout: Duration,
    /// Ceiling on consecutive response-pending frames per request
    pub max_response_pending: u8,
    /// Ceiling on incoming diagnostic payload length in bytes
    pub max_payload_len: u32,
    /// DoIP header protocol version byte
    pub protocol_version: u8,
    /// Use the TLS byte-stream transport instead of plain TCP (requires the
    /// `tls` feature and [DoipClientOptions::tls])
    pub use_tls: bool,
    /// Local endpoint to bind before connecting; `None` lets the OS choose
    pub local_address: Option<SocketAddr>,
    /// Bounds the TCP connect; `None` connects blocking
    pub connect_timeout: Option<Duration>,
    /// TLS client configuration and the name the gateway certificate is
    /// validated against
    #[cfg(feature = "tls")]
    pub tls: Option<TlsOptions>,
}

/// TLS parameters for [DoipClientOptions]
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsOptions {
    /// rustls client configuration (trust anchors, client certificate)
    pub config: std::sync::Arc<rustls::ClientConfig>,
    /// Name the gateway's certificate is validated against
    pub server_name: rustls::pki_types::ServerName<'static>,
}

impl Default for DoipClientOptions {
    fn default() -> Self {
        Self {
            tcp_read_timeout: None,
            routing_activation_timeout: Duration::from_millis(2000),
            diagnostic_ack_timeout: Duration::from_millis(2000),
            diagnostic_response_timeout: Duration::from_millis(5000),
            max_response_pending: 8,
            max_payload_len: 64 * 1024,
            protocol_version: PROTOCOL_VERSION_ISO_13400_2_2012,
            use_tls: false,
            local_address: None,
            connect_timeout: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

/// DoIP client: one diagnostic connection to a vehicle gateway
pub struct DoipClient {
    channel: DoipTcpChannel,
    options: DoipClientOptions,
}

impl DoipClient {
    /// Creates a client. `handler` receives every incoming diagnostic
    /// response for the lifetime of the client.
    pub fn new(options: DoipClientOptions, handler: Box<dyn UdsMessageHandler>) -> Self {
        Self {
            channel: DoipTcpChannel::new(&options, handler),
            options,
        }
    }

    /// Connects to the gateway at `remote`, constructing the TCP or TLS
    /// transport selected by the options
    pub fn connect_to_host(&mut self, remote: SocketAddr) -> ConnectionResult {
        let transport = match self.make_transport() {
            Ok(transport) => transport,
            Err(result) => return result,
        };
        self.connect_to_host_with(transport, remote)
    }

    /// Connects to `remote` over a caller-supplied (unconnected) transport
    pub fn connect_to_host_with(
        &mut self,
        mut transport: Box<dyn ByteStreamTransport>,
        remote: SocketAddr,
    ) -> ConnectionResult {
        if let Err(e) = transport.open(self.options.local_address) {
            error!("failed to open transport: {e}");
            return ConnectionResult::ConnectFailed;
        }
        self.channel.connect(transport, remote)
    }

    /// Shuts the connection down. Any outstanding request is woken with a
    /// cancellation.
    pub fn disconnect_from_host(&mut self) -> DisconnectionResult {
        self.channel.disconnect()
    }

    /// Runs the routing activation handshake authorizing `source_address`
    /// for diagnostic traffic on this connection
    pub fn activate_routing(
        &mut self,
        source_address: u16,
        activation_type: ActivationType,
    ) -> RoutingActivationResult {
        self.channel.activate_routing(source_address, activation_type)
    }

    /// Transmits one diagnostic request and blocks until the exchange
    /// concludes; the final response is delivered through the handler
    /// callbacks before this returns
    pub fn transmit(&mut self, message: &UdsMessage) -> TransmissionResult {
        self.channel.transmit(message)
    }

    /// Whether the channel currently has a live connection
    pub fn is_connected(&self) -> bool {
        self.channel.connection_state() == ConnectionState::Connected
    }

    /// Whether routing is activated for this connection, i.e. the gateway
    /// accepts diagnostic traffic from the activated source address
    pub fn is_routing_activated(&self) -> bool {
        self.channel.is_routing_activated()
    }

    fn make_transport(&self) -> Result<Box<dyn ByteStreamTransport>, ConnectionResult> {
        if self.options.use_tls {
            #[cfg(feature = "tls")]
            {
                let Some(tls) = &self.options.tls else {
                    error!("use_tls set without TLS options");
                    return Err(ConnectionResult::ConnectFailed);
                };
                return Ok(Box::new(crate::transport::TlsTransport::new(
                    tls.config.clone(),
                    tls.server_name.clone(),
                    self.options.connect_timeout,
                )));
            }
            #[cfg(not(feature = "tls"))]
            {
                error!("use_tls set but the crate was built without the tls feature");
                return Err(ConnectionResult::ConnectFailed);
            }
        }
        Ok(Box::new(TcpTransport::new(self.options.connect_timeout)))
    }
}
