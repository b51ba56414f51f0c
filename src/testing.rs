//! In-memory channel and scriptable devices for tests

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::channel::{Channel, Device, DeviceTable, SessionRouter, Transport, TransportError, TransportResult};
use crate::protocol::{decode_frame, encode_discovery_helo, encode_packet, DiscoveryData, Frame, Packet, PacketType};
use crate::Client;

/// Decides what a simulated device answers to a packet, and after how long
pub(crate) type Responder = Arc<dyn Fn(&Packet) -> Vec<(Duration, Packet)> + Send + Sync>;

pub(crate) fn responder(
    f: impl Fn(&Packet) -> Vec<(Duration, Packet)> + Send + Sync + 'static,
) -> Responder {
    Arc::new(f)
}

type SentLog = Arc<Mutex<Vec<Packet>>>;

pub(crate) struct MockDevice {
    info: DiscoveryData,
    responder: Responder,
    router: Option<SessionRouter>,
    sent: SentLog,
    link_down: bool,
}

impl MockDevice {
    /// A device that never answers and is attached to no client
    pub(crate) fn silent(info: DiscoveryData) -> Self {
        Self {
            info,
            responder: responder(|_| vec![]),
            router: None,
            sent: SentLog::default(),
            link_down: false,
        }
    }
}

impl fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDevice").field("info", &self.info).finish()
    }
}

#[async_trait]
impl Device for MockDevice {
    fn info(&self) -> &DiscoveryData {
        &self.info
    }

    fn address(&self) -> String {
        format!("mock:{}", self.info.dev_id)
    }

    async fn send(&self, bytes: &[u8]) -> TransportResult<()> {
        let Ok(Frame::Session(packet)) = decode_frame(bytes) else {
            return Ok(());
        };
        self.sent.lock().unwrap().push(packet.clone());

        if self.link_down {
            return Err(TransportError::Connection(format!("{} unreachable", self.info.dev_id)));
        }
        let Some(router) = self.router.clone() else {
            return Ok(());
        };
        for (delay, reply) in (self.responder)(&packet) {
            let router = router.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                router.route(encode_packet(&reply));
            });
        }
        Ok(())
    }
}

pub(crate) struct MockChannel {
    name: String,
    devices: DeviceTable,
    router: OnceLock<SessionRouter>,
    announced: Vec<(DiscoveryData, Responder)>,
    link_down: Vec<String>,
    sent: SentLog,
}

impl MockChannel {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            devices: DeviceTable::new(),
            router: OnceLock::new(),
            announced: Vec::new(),
            link_down: Vec::new(),
            sent: SentLog::default(),
        }
    }

    /// Add a device that answers this channel's discovery rounds
    pub(crate) fn with_device(mut self, info: DiscoveryData, responder: Responder) -> Self {
        self.announced.push((info, responder));
        self
    }

    /// Add a device that answers discovery but fails every later write
    pub(crate) fn with_unreachable_device(mut self, info: DiscoveryData) -> Self {
        self.link_down.push(info.dev_id.clone());
        self.announced.push((info, responder(|_| vec![])));
        self
    }

    /// Responder for frames injected by hand
    pub(crate) fn responder(&self) -> Responder {
        responder(|_| vec![])
    }

    /// Packets of one type written to any device of this channel, oldest first
    pub(crate) fn sent_of(&self, kind: PacketType) -> Vec<Packet> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&self, router: SessionRouter) {
        let _ = self.router.set(router);
    }

    async fn start_discovery(&self) -> TransportResult<()> {
        for (info, responder) in &self.announced {
            self.dispatch_inbound(&encode_discovery_helo(info), responder.clone());
        }
        Ok(())
    }

    fn devices(&self) -> &DeviceTable {
        &self.devices
    }
}

impl Transport for MockChannel {
    type Meta = Responder;

    fn router(&self) -> Option<&SessionRouter> {
        self.router.get()
    }

    fn register_device(&self, info: DiscoveryData, responder: Responder) {
        self.devices.insert(Arc::new(MockDevice {
            responder,
            router: self.router.get().cloned(),
            sent: self.sent.clone(),
            link_down: self.link_down.contains(&info.dev_id),
            info,
        }));
    }
}

/// A client with one mock channel on which `dev_id` has been discovered
pub(crate) async fn connected_client(dev_id: &str, responder: Responder) -> (Client, Arc<MockChannel>) {
    let channel = Arc::new(MockChannel::new("mock").with_device(DiscoveryData::new("fw", dev_id, 1), responder));

    let client = Client::new();
    client.add_channel(channel.clone());
    client.discover_wait(Duration::ZERO).await;
    assert!(client.device(dev_id).is_some());

    (client, channel)
}
