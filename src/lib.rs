#![warn(missing_docs)]
//! A DoIP (ISO 13400-2) client transport for UDS (ISO 14229) diagnostics.
//!
//! This crate carries diagnostic request/response traffic between a UDS
//! transport layer and a vehicle gateway: it establishes the TCP (optionally
//! TLS) session, performs the routing activation handshake that authorizes a
//! logical address pair, frames UDS payloads into DoIP diagnostic messages,
//! and discovers vehicles via UDP identification requests and announcements.
//!
//! The crate is organized in layers:
//! * [codec] - pure encode/decode of the DoIP generic header and payloads
//! * [transport] - byte-stream (TCP/TLS) and datagram (UDP) socket traits
//!   with standard implementations
//! * [channel] - the per-connection state machines and reader tasks
//! * [client] - the [DoipClient] façade driven by the UDS layer
//!
//! UDS semantics (sessions, security access, service encoding) are out of
//! scope; the UDS layer above supplies request bytes and receives response
//! bytes through the [uds::UdsMessageHandler] callbacks.
//!
//! ## Example
//!
//! ```rust,no_run
//! use doip_client::codec::ActivationType;
//! use doip_client::uds::{IndicationResult, TargetAddressType, UdsMessage, UdsMessageHandler};
//! use doip_client::{DoipClient, DoipClientOptions};
//! use std::net::IpAddr;
//!
//! struct PrintingHandler;
//!
//! impl UdsMessageHandler for PrintingHandler {
//!     fn indicate_message(
//!         &mut self,
//!         _source_address: u16,
//!         _target_address: u16,
//!         _target_address_type: TargetAddressType,
//!         _size: usize,
//!         _host_ip: IpAddr,
//!     ) -> IndicationResult {
//!         IndicationResult::Ok
//!     }
//!
//!     fn handle_message(&mut self, message: UdsMessage) {
//!         println!("ECU response: {:02X?}", message.payload);
//!     }
//! }
//!
//! let mut client = DoipClient::new(DoipClientOptions::default(), Box::new(PrintingHandler));
//! client.connect_to_host("192.168.1.20:13400".parse().unwrap());
//! client.activate_routing(0x0E80, ActivationType::Default);
//! client.transmit(&UdsMessage {
//!     source_address: 0x0E80,
//!     target_address: 0x0001,
//!     target_address_type: TargetAddressType::Physical,
//!     host_ip: "192.168.1.20".parse().unwrap(),
//!     payload: vec![0x22, 0xF1, 0x90],
//! });
//! client.disconnect_from_host();
//! ```

pub mod channel;
pub mod client;
pub mod codec;
pub mod transport;
pub mod uds;

pub use client::DoipClient;
pub use client::DoipClientOptions;
pub use codec::DOIP_PORT;
