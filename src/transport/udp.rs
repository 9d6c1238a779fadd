//! UDP datagram transport for vehicle discovery

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use super::{DatagramTransport, TransportError, TransportResult};

/// UDP implementation of [DatagramTransport]
#[derive(Default)]
pub struct UdpTransport {
    socket: Option<Arc<UdpSocket>>,
}

impl UdpTransport {
    /// Creates an unbound UDP transport
    pub fn new() -> Self {
        Self::default()
    }

    fn socket(&self) -> TransportResult<&Arc<UdpSocket>> {
        self.socket.as_ref().ok_or(TransportError::NotConnected)
    }
}

impl DatagramTransport for UdpTransport {
    fn open(&mut self, local: SocketAddr, broadcast: bool) -> TransportResult<()> {
        let socket = UdpSocket::bind(local).map_err(TransportError::BindingFailed)?;
        if broadcast {
            socket
                .set_broadcast(true)
                .map_err(TransportError::OpenFailed)?;
        }
        socket
            .set_nonblocking(false)
            .map_err(TransportError::OpenFailed)?;
        debug!("UDP socket bound to {local} (broadcast: {broadcast})");
        self.socket = Some(Arc::new(socket));
        Ok(())
    }

    fn send_to(&mut self, bytes: &[u8], remote: SocketAddr) -> TransportResult<()> {
        let socket = self.socket()?;
        let sent = socket.send_to(bytes, remote)?;
        if sent != bytes.len() {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "datagram truncated on send",
            )));
        }
        Ok(())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        let socket = self.socket()?;
        socket.recv_from(buf).map_err(super::map_read_err)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> TransportResult<()> {
        let socket = self.socket()?;
        socket.set_read_timeout(timeout)?;
        Ok(())
    }

    fn clone_datagram(&self) -> Box<dyn DatagramTransport> {
        Box::new(Self {
            socket: self.socket.clone(),
        })
    }
}
