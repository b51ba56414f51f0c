//! Multicom - Device discovery and request/reply messaging
//!
//! A [`Client`] aggregates channels (UDP broadcast, BLE), discovers devices
//! on all of them and opens [`Session`]s that talk to one device with
//! PING, GET, SEND and POST requests.

pub mod channel;
pub mod client;
pub mod config;
pub mod network;
pub mod protocol;
pub mod session;

#[cfg(test)]
mod testing;

pub use channel::{Channel, Device, DeviceTable, SessionRouter, Transport, TransportError, TransportResult};
pub use client::{Client, ClientError, ClientResult};
pub use config::Config;
pub use network::{BleChannel, UdpChannel};
pub use protocol::{DiscoveryData, PacketType};
pub use session::{RequestError, RequestResult, Session};
