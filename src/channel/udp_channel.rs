//! UDP channel for vehicle discovery
//!
//! Discovery is stateless: the channel sends vehicle identification requests
//! (unicast to a known gateway, or broadcast) and a background receive task
//! hands every vehicle announcement (`0x0004`) to the UDS layer together with
//! the endpoint it came from. Nothing is retried; announcements also arrive
//! unsolicited when a vehicle powers up.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, warn};

use crate::codec::{
    encode_frame, DoipHeader, DoipMessage, EidVinSelector, GenericNack, PayloadType,
    VehicleAnnouncement, VehicleIdentificationRequest, DOIP_HEADER_LEN, DOIP_PORT,
};
use crate::transport::{DatagramTransport, TransportError, TransportResult};

use super::CONTROL_PAYLOAD_CEILING;

/// Addressing mode of a discovery channel, fixed at construction
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UdpChannelMode {
    /// Requests go to one known gateway endpoint
    Unicast,
    /// Requests go to the local broadcast address
    Broadcast,
}

/// Callback the discovery channel invokes for every vehicle announcement.
/// Runs on the channel's receive task.
pub trait VehicleDiscoveryHandler: Send {
    /// Called with the announcing endpoint and the decoded announcement
    fn handle_vehicle_announcement(
        &mut self,
        source: SocketAddr,
        announcement: VehicleAnnouncement,
    );
}

/// UDP vehicle discovery channel
pub struct DoipUdpChannel {
    transport: Box<dyn DatagramTransport>,
    protocol_version: u8,
    exit: Arc<AtomicBool>,
    receiver_thread: Option<JoinHandle<()>>,
}

impl DoipUdpChannel {
    /// Binds `local` and starts the announcement receive task
    pub fn new(
        mut transport: Box<dyn DatagramTransport>,
        local: SocketAddr,
        mode: UdpChannelMode,
        protocol_version: u8,
        handler: Box<dyn VehicleDiscoveryHandler>,
    ) -> TransportResult<Self> {
        transport.open(local, mode == UdpChannelMode::Broadcast)?;
        let mut receiver = transport.clone_datagram();
        // the receive loop polls the exit flag between reads
        receiver.set_read_timeout(Some(Duration::from_millis(500)))?;
        let exit = Arc::new(AtomicBool::new(false));
        let receiver_thread = {
            let exit = exit.clone();
            std::thread::spawn(move || receive_task(receiver, exit, handler))
        };
        Ok(Self {
            transport,
            protocol_version,
            exit,
            receiver_thread: Some(receiver_thread),
        })
    }

    /// Sends a vehicle identification request to `remote`, optionally
    /// narrowed by an EID or VIN selector
    pub fn send_vehicle_identification_request(
        &mut self,
        remote: SocketAddr,
        selector: EidVinSelector,
    ) -> TransportResult<()> {
        let request = VehicleIdentificationRequest { selector };
        let frame = encode_frame(
            self.protocol_version,
            PayloadType::VehicleIdentificationRequest,
            &request.encode_payload(),
        );
        debug!("vehicle identification request -> {remote}");
        self.transport.send_to(&frame, remote)
    }

    /// Broadcasts a vehicle identification request on the DoIP discovery port
    pub fn broadcast_vehicle_identification_request(
        &mut self,
        selector: EidVinSelector,
    ) -> TransportResult<()> {
        self.send_vehicle_identification_request(
            SocketAddr::from((Ipv4Addr::BROADCAST, DOIP_PORT)),
            selector,
        )
    }
}

impl Drop for DoipUdpChannel {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::Relaxed);
        if let Some(thread) = self.receiver_thread.take() {
            let _ = thread.join();
        }
    }
}

fn receive_task(
    mut transport: Box<dyn DatagramTransport>,
    exit: Arc<AtomicBool>,
    mut handler: Box<dyn VehicleDiscoveryHandler>,
) {
    let mut buf = [0u8; 2048];
    while !exit.load(Ordering::Relaxed) {
        let (len, source) = match transport.recv_from(&mut buf) {
            Ok(received) => received,
            Err(TransportError::ReadTimeout) => continue,
            Err(e) => {
                error!("discovery receive failed: {e}");
                return;
            }
        };
        if len < DOIP_HEADER_LEN {
            warn!("dropping {len} byte datagram from {source}, shorter than a DoIP header");
            continue;
        }
        let mut header_bytes = [0u8; DOIP_HEADER_LEN];
        header_bytes.copy_from_slice(&buf[..DOIP_HEADER_LEN]);
        let header = match DoipHeader::decode(&header_bytes, CONTROL_PAYLOAD_CEILING) {
            Ok(header) => header,
            Err(e) => {
                warn!("dropping datagram from {source}: {e}");
                continue;
            }
        };
        if header.payload_length as usize != len - DOIP_HEADER_LEN {
            warn!(
                "dropping datagram from {source}: announced {} payload bytes, got {}",
                header.payload_length,
                len - DOIP_HEADER_LEN
            );
            continue;
        }
        let message = DoipMessage {
            payload: buf[DOIP_HEADER_LEN..len].to_vec(),
            header,
            source,
        };
        match message.header.payload_type {
            PayloadType::VehicleAnnouncement => {
                match VehicleAnnouncement::decode_payload(&message.payload) {
                    Ok(announcement) => {
                        debug!(
                            "vehicle announcement from {source}, logical address 0x{:04X}",
                            announcement.logical_address
                        );
                        handler.handle_vehicle_announcement(message.source, announcement);
                    }
                    Err(e) => warn!("dropping undecodable vehicle announcement: {e}"),
                }
            }
            PayloadType::GenericNack => match GenericNack::decode_payload(&message.payload) {
                Ok(nack) => warn!("{source} rejected a discovery request: {:?}", nack.nack_code),
                Err(e) => warn!("dropping undecodable generic NACK: {e}"),
            },
            other => debug!(
                "ignoring datagram of payload type 0x{:04X} from {source}",
                u16::from(other)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FurtherAction, SyncStatus, VIN_LEN};
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::{Condvar, Mutex};

    #[derive(Default)]
    struct SimSocketInner {
        incoming: VecDeque<(Vec<u8>, SocketAddr)>,
        sent: Vec<(Vec<u8>, SocketAddr)>,
    }

    /// In-memory datagram socket; tests push datagrams into `incoming`
    #[derive(Clone, Default)]
    struct SimDatagramTransport {
        inner: Arc<(Mutex<SimSocketInner>, Condvar)>,
        read_timeout: Option<Duration>,
    }

    impl SimDatagramTransport {
        fn push_incoming(&self, bytes: Vec<u8>, source: SocketAddr) {
            let (lock, cond) = &*self.inner;
            lock.lock().unwrap().incoming.push_back((bytes, source));
            cond.notify_all();
        }
    }

    impl DatagramTransport for SimDatagramTransport {
        fn open(&mut self, _local: SocketAddr, _broadcast: bool) -> TransportResult<()> {
            Ok(())
        }

        fn send_to(&mut self, bytes: &[u8], remote: SocketAddr) -> TransportResult<()> {
            let (lock, _) = &*self.inner;
            lock.lock().unwrap().sent.push((bytes.to_vec(), remote));
            Ok(())
        }

        fn recv_from(&mut self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
            let (lock, cond) = &*self.inner;
            let mut inner = lock.lock().unwrap();
            loop {
                if let Some((bytes, source)) = inner.incoming.pop_front() {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    return Ok((bytes.len(), source));
                }
                let timeout = self.read_timeout.unwrap_or(Duration::from_secs(1));
                let (guard, res) = cond.wait_timeout(inner, timeout).unwrap();
                inner = guard;
                if res.timed_out() && inner.incoming.is_empty() {
                    return Err(TransportError::ReadTimeout);
                }
            }
        }

        fn set_read_timeout(&mut self, timeout: Option<Duration>) -> TransportResult<()> {
            self.read_timeout = timeout;
            Ok(())
        }

        fn clone_datagram(&self) -> Box<dyn DatagramTransport> {
            Box::new(self.clone())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingDiscoveryHandler {
        announcements: Arc<Mutex<Vec<(SocketAddr, VehicleAnnouncement)>>>,
    }

    impl VehicleDiscoveryHandler for RecordingDiscoveryHandler {
        fn handle_vehicle_announcement(
            &mut self,
            source: SocketAddr,
            announcement: VehicleAnnouncement,
        ) {
            self.announcements.lock().unwrap().push((source, announcement));
        }
    }

    fn local() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }

    fn wait_for<F: Fn() -> bool>(predicate: F) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !predicate() {
            assert!(std::time::Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn identification_request_carries_vin_selector() {
        let socket = SimDatagramTransport::default();
        let handle = socket.clone();
        let handler = RecordingDiscoveryHandler::default();
        let mut channel = DoipUdpChannel::new(
            Box::new(socket),
            local(),
            UdpChannelMode::Unicast,
            0x02,
            Box::new(handler),
        )
        .unwrap();

        let gateway: SocketAddr = "192.168.1.20:13400".parse().unwrap();
        channel
            .send_vehicle_identification_request(
                gateway,
                EidVinSelector::Vin(*b"WDB9634031L123456"),
            )
            .unwrap();

        let (lock, _) = &*handle.inner;
        let sent = lock.lock().unwrap().sent.clone();
        assert_eq!(sent.len(), 1);
        let (frame, remote) = &sent[0];
        assert_eq!(*remote, gateway);
        assert_eq!(frame.len(), DOIP_HEADER_LEN + VIN_LEN);
        assert_eq!(&frame[2..4], &[0x00, 0x01]);
    }

    #[test]
    fn announcements_reach_the_handler() {
        let socket = SimDatagramTransport::default();
        let handle = socket.clone();
        let handler = RecordingDiscoveryHandler::default();
        let announcements = handler.announcements.clone();
        let _channel = DoipUdpChannel::new(
            Box::new(socket),
            local(),
            UdpChannelMode::Broadcast,
            0x02,
            Box::new(handler),
        )
        .unwrap();

        let announcement = VehicleAnnouncement {
            vin: *b"WDB9634031L123456",
            logical_address: 0x1234,
            eid: [0x0A; 6],
            gid: [0x0B; 6],
            further_action: FurtherAction::None,
            sync_status: Some(SyncStatus::Synchronized),
        };
        let gateway: SocketAddr = "192.168.1.20:13400".parse().unwrap();
        handle.push_incoming(
            encode_frame(
                0x02,
                PayloadType::VehicleAnnouncement,
                &announcement.encode_payload(),
            ),
            gateway,
        );
        // truncated datagram must be dropped without disturbing the task
        handle.push_incoming(vec![0x02, 0xFD, 0x00], gateway);

        wait_for(|| !announcements.lock().unwrap().is_empty());
        let seen = announcements.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, gateway);
        assert_eq!(seen[0].1, announcement);
    }
}
