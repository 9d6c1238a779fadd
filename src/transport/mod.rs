//! Transport abstractions consumed by the DoIP channels
//!
//! Channels never touch sockets directly; they speak to a byte-stream
//! transport (TCP, or TLS when the `tls` feature is enabled) and a datagram
//! transport (UDP). The concrete implementations in the submodules cover the
//! common case, while tests and special deployments can supply their own by
//! implementing the traits.

pub mod tcp;

#[cfg(feature = "tls")]
pub mod tls;

pub mod udp;

pub use tcp::TcpTransport;
#[cfg(feature = "tls")]
pub use tls::TlsTransport;
pub use udp::UdpTransport;

use std::net::SocketAddr;
use std::time::Duration;

/// Transport operation result
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
/// Error produced by a byte-stream or datagram transport
pub enum TransportError {
    /// Creating or configuring the socket failed
    #[error("failed to open socket: {0}")]
    OpenFailed(#[source] std::io::Error),
    /// Binding the local endpoint failed
    #[error("failed to bind local endpoint: {0}")]
    BindingFailed(#[source] std::io::Error),
    /// Connecting to the remote endpoint failed
    #[error("connect to remote endpoint failed: {0}")]
    ConnectFailed(#[source] std::io::Error),
    /// Connecting did not complete within the configured timeout
    #[error("connect timed out")]
    ConnectTimeout,
    /// The peer closed the connection
    #[error("peer closed the connection")]
    Eof,
    /// A read did not complete within the configured timeout
    #[error("read timed out")]
    ReadTimeout,
    /// The transport is not connected (or not bound, for datagrams)
    #[error("transport is not connected")]
    NotConnected,
    /// TLS handshake or record processing failed
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    /// Any other I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connected, full-duplex, reliable byte stream (TCP or TLS over TCP).
///
/// The channel layer drives one handle from its reader task and a second
/// handle (obtained through [ByteStreamTransport::clone_stream]) from the
/// transmit path. Exactly one handle may be used for reading; any handle may
/// write; [ByteStreamTransport::shutdown] through any handle unblocks a
/// reader blocked in [ByteStreamTransport::read_exact].
pub trait ByteStreamTransport: Send {
    /// Prepares the socket, binding `local` when given.
    fn open(&mut self, local: Option<SocketAddr>) -> TransportResult<()>;

    /// Connects to `remote`. On success the transport is readable and
    /// writable.
    fn connect(&mut self, remote: SocketAddr) -> TransportResult<()>;

    /// Writes all of `bytes` or fails.
    fn send(&mut self, bytes: &[u8]) -> TransportResult<()>;

    /// Blocks until `buf` is completely filled. Returns
    /// [TransportError::Eof] when the peer closes first.
    fn read_exact(&mut self, buf: &mut [u8]) -> TransportResult<()>;

    /// Bounds every subsequent [ByteStreamTransport::read_exact]. `None`
    /// restores unbounded blocking reads.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> TransportResult<()>;

    /// Gracefully shuts the stream down. Idempotent; safe to call from a
    /// thread other than the reader.
    fn shutdown(&mut self);

    /// Remote endpoint of the connected stream
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Returns a second handle onto the same connected stream
    fn clone_stream(&self) -> Box<dyn ByteStreamTransport>;
}

/// An unconnected datagram socket (UDP) used for vehicle discovery.
pub trait DatagramTransport: Send {
    /// Binds `local`; `broadcast` additionally enables broadcast sends.
    fn open(&mut self, local: SocketAddr, broadcast: bool) -> TransportResult<()>;

    /// Sends one datagram to `remote`.
    fn send_to(&mut self, bytes: &[u8], remote: SocketAddr) -> TransportResult<()>;

    /// Receives one datagram, returning its length and source endpoint.
    fn recv_from(&mut self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Bounds every subsequent [DatagramTransport::recv_from].
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> TransportResult<()>;

    /// Returns a second handle onto the same bound socket
    fn clone_datagram(&self) -> Box<dyn DatagramTransport>;
}

/// Maps an I/O error from a blocking read to the transport error kinds the
/// channel layer distinguishes.
pub(crate) fn map_read_err(err: std::io::Error) -> TransportError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof => TransportError::Eof,
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            TransportError::ReadTimeout
        }
        _ => TransportError::Io(err),
    }
}
