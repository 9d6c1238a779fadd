//! Plain TCP byte-stream transport

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use socket2::{Domain, Protocol, Socket, Type};

use super::{map_read_err, ByteStreamTransport, TransportError, TransportResult};

/// TCP implementation of [ByteStreamTransport].
///
/// The socket is created and optionally bound in [ByteStreamTransport::open],
/// mirroring the open/bind/connect split of the channel contract. After
/// [ByteStreamTransport::connect], clones share the connected stream, which
/// supports one reading thread and concurrent writers.
pub struct TcpTransport {
    connect_timeout: Option<Duration>,
    socket: Option<Socket>,
    stream: Option<Arc<TcpStream>>,
}

impl TcpTransport {
    /// Creates an unconnected TCP transport. `connect_timeout` bounds
    /// [ByteStreamTransport::connect]; `None` connects blocking.
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self {
            connect_timeout,
            socket: None,
            stream: None,
        }
    }

    pub(crate) fn stream(&self) -> TransportResult<&Arc<TcpStream>> {
        self.stream.as_ref().ok_or(TransportError::NotConnected)
    }

    pub(crate) fn clone_tcp(&self) -> TcpTransport {
        Self {
            connect_timeout: self.connect_timeout,
            socket: None,
            stream: self.stream.clone(),
        }
    }
}

impl ByteStreamTransport for TcpTransport {
    fn open(&mut self, local: Option<SocketAddr>) -> TransportResult<()> {
        let domain = match local {
            Some(SocketAddr::V6(_)) => Domain::IPV6,
            _ => Domain::IPV4,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(TransportError::OpenFailed)?;
        socket
            .set_reuse_address(true)
            .map_err(TransportError::OpenFailed)?;
        socket
            .set_nonblocking(false)
            .map_err(TransportError::OpenFailed)?;
        if let Some(local) = local {
            socket
                .bind(&local.into())
                .map_err(TransportError::BindingFailed)?;
            debug!("TCP socket bound to {local}");
        }
        self.socket = Some(socket);
        Ok(())
    }

    fn connect(&mut self, remote: SocketAddr) -> TransportResult<()> {
        if self.socket.is_none() {
            self.open(None)?;
        }
        let socket = self.socket.take().ok_or(TransportError::NotConnected)?;
        match self.connect_timeout {
            Some(timeout) => socket
                .connect_timeout(&remote.into(), timeout)
                .map_err(|e| {
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) {
                        TransportError::ConnectTimeout
                    } else {
                        TransportError::ConnectFailed(e)
                    }
                })?,
            None => socket
                .connect(&remote.into())
                .map_err(TransportError::ConnectFailed)?,
        }
        let stream: TcpStream = socket.into();
        // connect_timeout leaves the socket non-blocking; reads must block
        stream
            .set_nonblocking(false)
            .map_err(TransportError::ConnectFailed)?;
        debug!("TCP stream connected to {remote}");
        self.stream = Some(Arc::new(stream));
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> TransportResult<()> {
        let stream = self.stream()?;
        (&**stream).write_all(bytes)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> TransportResult<()> {
        let stream = self.stream()?;
        (&**stream).read_exact(buf).map_err(map_read_err)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> TransportResult<()> {
        let stream = self.stream()?;
        stream.set_read_timeout(timeout)?;
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    fn clone_stream(&self) -> Box<dyn ByteStreamTransport> {
        Box::new(self.clone_tcp())
    }
}
