//! Channel module - The transport contract
//!
//! A channel owns the devices discovered over one transport (UDP broadcast,
//! BLE, ...) and delivers inbound bytes upward:
//! - discovery replies register a device on the channel itself
//! - every other frame is handed to the client's [`SessionRouter`]
//!
//! Receive paths may run on any thread. They never touch session state
//! directly; the router queues frames for the client's dispatch task.

mod table;

pub use table::*;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{peek_type, DiscoveryData, PacketType};

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("Transport closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Handle to one remote endpoint reachable through a channel
#[async_trait]
pub trait Device: Send + Sync + fmt::Debug {
    /// Identity reported in the device's discovery reply
    fn info(&self) -> &DiscoveryData;

    /// Transport specific address, for display
    fn address(&self) -> String;

    /// Write raw bytes to the device
    async fn send(&self, bytes: &[u8]) -> TransportResult<()>;
}

/// A transport backend as seen by the client
#[async_trait]
pub trait Channel: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Attach the client's router. A channel belongs to one client.
    fn bind(&self, router: SessionRouter);

    /// Send discovery probes and return once the transport's discovery
    /// window has elapsed. Replies arrive through the inbound path.
    async fn start_discovery(&self) -> TransportResult<()>;

    /// Devices discovered on this channel
    fn devices(&self) -> &DeviceTable;
}

/// Inbound half of the contract, implemented by every concrete channel
pub trait Transport: Channel {
    /// What the receive path knows about the sender (address, connection, ...)
    type Meta: Send;

    fn router(&self) -> Option<&SessionRouter>;

    /// Insert or overwrite the device registered under `data.dev_id`
    fn register_device(&self, data: DiscoveryData, meta: Self::Meta);

    /// Entry point for every frame the transport receives.
    ///
    /// Returns the packet type, or `None` when the frame could not be decoded.
    fn dispatch_inbound(&self, bytes: &[u8], meta: Self::Meta) -> Option<PacketType> {
        let kind = match peek_type(bytes) {
            Ok(kind) => kind,
            Err(e) => {
                tracing::debug!(channel = self.name(), "Dropping inbound frame: {}", e);
                return None;
            }
        };

        match kind {
            PacketType::DiscoveryHelo => match DiscoveryData::parse(&bytes[1..]) {
                Ok(data) => self.register_device(data, meta),
                Err(e) => tracing::debug!(channel = self.name(), "Ignoring discovery reply: {}", e),
            },
            // Our own probe, or another client's, echoed by the broadcast
            PacketType::Discovery => {}
            _ => match self.router() {
                Some(router) => {
                    if !router.route(Bytes::copy_from_slice(bytes)) {
                        tracing::debug!(channel = self.name(), "Client gone, dropping {:?}", kind);
                    }
                }
                None => tracing::debug!(channel = self.name(), "Channel not bound, dropping {:?}", kind),
            },
        }

        Some(kind)
    }
}

/// Hands session frames to the client's dispatch task.
///
/// Cloneable and callable from any thread.
#[derive(Debug, Clone)]
pub struct SessionRouter {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl SessionRouter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }

    /// Queue a frame. Returns false once the client has shut down.
    pub fn route(&self, frame: Bytes) -> bool {
        self.tx.send(frame).is_ok()
    }
}
