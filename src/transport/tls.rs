//! TLS 1.2+ byte-stream transport backed by rustls
//!
//! Presents the identical [ByteStreamTransport] contract as the plain TCP
//! transport, so the channel layer does not distinguish the two. Certificate
//! and trust policy are entirely the caller's: the transport is constructed
//! from a ready [rustls::ClientConfig].
//!
//! The stream is used full-duplex from two threads (channel reader, transmit
//! path), which blocking TLS only allows if nobody sleeps holding the
//! session. The reader therefore blocks on the raw TCP socket and locks the
//! session solely to decrypt what arrived; writers lock it to encrypt and
//! flush.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use rustls::pki_types::ServerName;
use rustls::ClientConnection;

use super::tcp::TcpTransport;
use super::{map_read_err, ByteStreamTransport, TransportError, TransportResult};

/// TLS implementation of [ByteStreamTransport]
pub struct TlsTransport {
    config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
    tcp: TcpTransport,
    session: Option<Arc<Mutex<ClientConnection>>>,
    // decrypted bytes not yet consumed; only the reading handle fills this
    plaintext: Vec<u8>,
}

impl TlsTransport {
    /// Creates an unconnected TLS transport. `server_name` is the name the
    /// gateway's certificate is validated against (a DNS name or the
    /// gateway's IP address).
    pub fn new(
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            config,
            server_name,
            tcp: TcpTransport::new(connect_timeout),
            session: None,
            plaintext: Vec::new(),
        }
    }

    fn parts(&self) -> TransportResult<(Arc<Mutex<ClientConnection>>, Arc<TcpStream>)> {
        let session = self.session.clone().ok_or(TransportError::NotConnected)?;
        let stream = self.tcp.stream()?.clone();
        Ok((session, stream))
    }
}

impl ByteStreamTransport for TlsTransport {
    fn open(&mut self, local: Option<SocketAddr>) -> TransportResult<()> {
        self.tcp.open(local)
    }

    fn connect(&mut self, remote: SocketAddr) -> TransportResult<()> {
        self.tcp.connect(remote)?;
        let mut session = ClientConnection::new(self.config.clone(), self.server_name.clone())?;
        let stream = self.tcp.stream()?.clone();
        while session.is_handshaking() {
            session
                .complete_io(&mut &*stream)
                .map_err(TransportError::ConnectFailed)?;
        }
        debug!("TLS handshake complete with {remote}");
        self.session = Some(Arc::new(Mutex::new(session)));
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> TransportResult<()> {
        let (session, stream) = self.parts()?;
        let mut session = session.lock().unwrap();
        session.writer().write_all(bytes)?;
        while session.wants_write() {
            session.write_tls(&mut &*stream)?;
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> TransportResult<()> {
        let (session, stream) = self.parts()?;
        let mut filled = 0;
        loop {
            let take = (buf.len() - filled).min(self.plaintext.len());
            if take > 0 {
                buf[filled..filled + take].copy_from_slice(&self.plaintext[..take]);
                self.plaintext.drain(..take);
                filled += take;
            }
            if filled == buf.len() {
                return Ok(());
            }
            // block on the raw socket only, with the session unlocked, so
            // writers are never stalled behind the reader
            let mut raw = [0u8; 4096];
            let n = (&*stream).read(&mut raw).map_err(map_read_err)?;
            if n == 0 {
                return Err(TransportError::Eof);
            }
            let mut session = session.lock().unwrap();
            let mut cursor = &raw[..n];
            while !cursor.is_empty() {
                session.read_tls(&mut cursor)?;
                let state = session.process_new_packets()?;
                let pending = state.plaintext_bytes_to_read();
                if pending > 0 {
                    let start = self.plaintext.len();
                    self.plaintext.resize(start + pending, 0);
                    session
                        .reader()
                        .read_exact(&mut self.plaintext[start..])
                        .map_err(map_read_err)?;
                }
                if state.peer_has_closed() && self.plaintext.is_empty() {
                    return Err(TransportError::Eof);
                }
            }
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> TransportResult<()> {
        self.tcp.set_read_timeout(timeout)
    }

    fn shutdown(&mut self) {
        if let Ok((session, stream)) = self.parts() {
            let mut session = session.lock().unwrap();
            session.send_close_notify();
            while session.wants_write() {
                if session.write_tls(&mut &*stream).is_err() {
                    break;
                }
            }
        }
        self.tcp.shutdown();
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.tcp.remote_addr()
    }

    fn clone_stream(&self) -> Box<dyn ByteStreamTransport> {
        Box::new(Self {
            config: self.config.clone(),
            server_name: self.server_name.clone(),
            tcp: self.tcp.clone_tcp(),
            session: self.session.clone(),
            plaintext: Vec::new(),
        })
    }
}
