//! UDP broadcast channel
//!
//! Discovery broadcasts a single zero byte a few times to the port devices
//! listen on. Devices answer from their own address, which is where all
//! later session traffic for them is sent.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::broadcast_address;
use crate::channel::{Channel, Device, DeviceTable, SessionRouter, Transport, TransportError, TransportResult};
use crate::config::UdpConfig;
use crate::protocol::{encode_discovery_probe, DiscoveryData};

/// A device reached through a [`UdpChannel`]
#[derive(Debug)]
pub struct UdpDevice {
    info: DiscoveryData,
    addr: SocketAddr,
    socket: Arc<UdpSocket>,
}

impl UdpDevice {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Device for UdpDevice {
    fn info(&self) -> &DiscoveryData {
        &self.info
    }

    fn address(&self) -> String {
        self.addr.to_string()
    }

    async fn send(&self, bytes: &[u8]) -> TransportResult<()> {
        self.socket.send_to(bytes, self.addr).await?;
        Ok(())
    }
}

/// Channel over one broadcast domain
pub struct UdpChannel {
    name: String,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    probe_count: u32,
    probe_interval: Duration,
    devices: DeviceTable,
    router: OnceLock<SessionRouter>,
    receiver: JoinHandle<()>,
}

impl UdpChannel {
    /// Bind a channel broadcasting into `subnet` (CIDR), or to the platform
    /// broadcast address when `subnet` is `None`.
    ///
    /// Starts the receive task; it stops when the channel is dropped.
    pub async fn bind(config: &UdpConfig, subnet: Option<&str>) -> TransportResult<Arc<Self>> {
        let broadcast = match subnet {
            Some(subnet) => broadcast_address(subnet)?,
            None => Ipv4Addr::BROADCAST,
        };

        let local_ip: IpAddr = match &config.local_ip {
            Some(ip) => ip
                .parse()
                .map_err(|_| TransportError::Connection(format!("Invalid local address: {}", ip)))?,
            None => Ipv4Addr::UNSPECIFIED.into(),
        };

        let socket = UdpSocket::bind((local_ip, 0)).await?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr()?;

        let name = match subnet {
            Some(subnet) => format!("udp:{}", subnet),
            None => "udp".to_string(),
        };

        let channel = Arc::new_cyclic(|me: &Weak<UdpChannel>| Self {
            name,
            socket: socket.clone(),
            target: SocketAddr::new(broadcast.into(), config.port),
            probe_count: config.probe_count,
            probe_interval: config.probe_interval(),
            devices: DeviceTable::new(),
            router: OnceLock::new(),
            receiver: tokio::spawn(receive_loop(me.clone(), socket.clone(), config.recv_buffer)),
        });

        tracing::info!(
            channel = %channel.name,
            "UDP channel bound on {}, broadcasting to {}",
            local_addr,
            channel.target
        );
        Ok(channel)
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Where discovery probes are sent
    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

#[async_trait]
impl Channel for UdpChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&self, router: SessionRouter) {
        if self.router.set(router).is_err() {
            tracing::warn!(channel = %self.name, "Channel is already bound to a client");
        }
    }

    async fn start_discovery(&self) -> TransportResult<()> {
        let probe = encode_discovery_probe();

        for _ in 0..self.probe_count {
            if let Err(e) = self.socket.send_to(&probe, self.target).await {
                tracing::warn!(channel = %self.name, "Discovery probe to {} failed: {}", self.target, e);
            }
            tokio::time::sleep(self.probe_interval).await;
        }
        Ok(())
    }

    fn devices(&self) -> &DeviceTable {
        &self.devices
    }
}

impl Transport for UdpChannel {
    type Meta = SocketAddr;

    fn router(&self) -> Option<&SessionRouter> {
        self.router.get()
    }

    fn register_device(&self, info: DiscoveryData, addr: SocketAddr) {
        let dev_id = info.dev_id.clone();
        let device = UdpDevice {
            info,
            addr,
            socket: self.socket.clone(),
        };

        if self.devices.insert(Arc::new(device)) {
            tracing::info!(channel = %self.name, "Discovered {} at {}", dev_id, addr);
        } else {
            tracing::debug!(channel = %self.name, "Refreshed {} at {}", dev_id, addr);
        }
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn receive_loop(channel: Weak<UdpChannel>, socket: Arc<UdpSocket>, buffer_size: usize) {
    let mut buf = vec![0u8; buffer_size];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            // ICMP unreachable from an earlier send, surfaced on some platforms
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused) => continue,
            Err(e) => {
                tracing::warn!("UDP receive failed, stopping receiver: {}", e);
                break;
            }
        };

        let Some(channel) = channel.upgrade() else {
            break;
        };
        channel.dispatch_inbound(&buf[..len], from);
    }
}
