//! BLE channel over the Nordic UART Service (NUS)
//!
//! Discovery scans for peripherals, then probes each one concurrently:
//! connect, write the probe to the write characteristic and read the answer
//! back from the notify characteristic. Peripherals that answer with a
//! discovery reply stay connected. Session replies arrive as notifications.
//!
//! The radio itself sits behind [`GattAdapter`] and [`GattPeripheral`], so
//! any host BLE stack can back the channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::channel::{Channel, Device, DeviceTable, SessionRouter, Transport, TransportResult};
use crate::config::BleConfig;
use crate::protocol::{encode_discovery_probe, DiscoveryData, PacketType};

/// Nordic UART Service
pub const NUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// Client to device (write)
pub const NUS_WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Device to client (notify, read)
pub const NUS_NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Called with the value of every notification
pub type NotifyCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A host BLE stack able to scan for peripherals
#[async_trait]
pub trait GattAdapter: Send + Sync + 'static {
    type Peripheral: GattPeripheral;

    /// Scan for `timeout` and return every peripheral seen
    async fn scan(&self, timeout: Duration) -> TransportResult<Vec<Self::Peripheral>>;
}

/// One remote peripheral
#[async_trait]
pub trait GattPeripheral: Send + Sync + 'static {
    /// Hardware address, for display
    fn address(&self) -> String;

    async fn is_connected(&self) -> bool;

    async fn connect(&self) -> TransportResult<()>;

    async fn disconnect(&self) -> TransportResult<()>;

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> TransportResult<()>;

    async fn read(&self, characteristic: Uuid) -> TransportResult<Vec<u8>>;

    /// Start notifications on `characteristic`, replacing any earlier callback
    async fn subscribe(&self, characteristic: Uuid, callback: NotifyCallback) -> TransportResult<()>;
}

/// A device reached through a [`BleChannel`]
pub struct BleDevice<P: GattPeripheral> {
    info: DiscoveryData,
    peripheral: Arc<P>,
    notify: NotifyCallback,
    subscribed: Arc<Mutex<bool>>,
}

impl<P: GattPeripheral> BleDevice<P> {
    /// Connect if needed and make sure replies are being delivered
    async fn ensure_ready(&self) -> TransportResult<()> {
        let mut subscribed = self.subscribed.lock().await;

        if !self.peripheral.is_connected().await {
            tracing::debug!(device = %self.info.dev_id, "Reconnecting");
            self.peripheral.connect().await?;
            *subscribed = false;
        }

        if !*subscribed {
            self.peripheral
                .subscribe(NUS_NOTIFY_CHAR_UUID, self.notify.clone())
                .await?;
            *subscribed = true;
        }
        Ok(())
    }
}

impl<P: GattPeripheral> fmt::Debug for BleDevice<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleDevice")
            .field("info", &self.info)
            .field("address", &self.peripheral.address())
            .finish()
    }
}

#[async_trait]
impl<P: GattPeripheral> Device for BleDevice<P> {
    fn info(&self) -> &DiscoveryData {
        &self.info
    }

    fn address(&self) -> String {
        self.peripheral.address()
    }

    async fn send(&self, bytes: &[u8]) -> TransportResult<()> {
        self.ensure_ready().await?;
        self.peripheral.write(NUS_WRITE_CHAR_UUID, bytes).await
    }
}

/// Channel over every NUS peripheral in range
pub struct BleChannel<A: GattAdapter> {
    adapter: A,
    scan_timeout: Duration,
    devices: DeviceTable,
    router: OnceLock<SessionRouter>,
    /// Subscription state per device, shared by every entry for the same peripheral
    links: std::sync::Mutex<HashMap<String, Link<A::Peripheral>>>,
    me: Weak<BleChannel<A>>,
}

struct Link<P> {
    peripheral: Weak<P>,
    subscribed: Arc<Mutex<bool>>,
}

impl<A: GattAdapter> BleChannel<A> {
    pub fn new(adapter: A, config: &BleConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            adapter,
            scan_timeout: config.scan_timeout(),
            devices: DeviceTable::new(),
            router: OnceLock::new(),
            links: std::sync::Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    /// Subscription state for `dev_id`, kept while it stays on the same peripheral
    fn subscription_state(&self, dev_id: &str, peripheral: &Arc<A::Peripheral>) -> Arc<Mutex<bool>> {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(link) = links.get(dev_id) {
            if Weak::ptr_eq(&link.peripheral, &Arc::downgrade(peripheral)) {
                return link.subscribed.clone();
            }
        }

        let subscribed = Arc::new(Mutex::new(false));
        links.insert(
            dev_id.to_string(),
            Link {
                peripheral: Arc::downgrade(peripheral),
                subscribed: subscribed.clone(),
            },
        );
        subscribed
    }

    /// Ask one peripheral who it is. Anything but a discovery reply
    /// disconnects it again.
    async fn probe(self: Arc<Self>, peripheral: Arc<A::Peripheral>) {
        let address = peripheral.address();

        let answer: TransportResult<Vec<u8>> = async {
            peripheral.connect().await?;
            peripheral
                .write(NUS_WRITE_CHAR_UUID, &encode_discovery_probe())
                .await?;
            peripheral.read(NUS_NOTIFY_CHAR_UUID).await
        }
        .await;

        let keep = match answer {
            Ok(reply) if !reply.is_empty() => {
                self.dispatch_inbound(&reply, peripheral.clone()) == Some(PacketType::DiscoveryHelo)
            }
            Ok(_) => false,
            Err(e) => {
                tracing::debug!(peripheral = %address, "Probe failed: {}", e);
                false
            }
        };

        if !keep {
            if let Err(e) = peripheral.disconnect().await {
                tracing::debug!(peripheral = %address, "Disconnect failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl<A: GattAdapter> Channel for BleChannel<A> {
    fn name(&self) -> &str {
        "ble"
    }

    fn bind(&self, router: SessionRouter) {
        if self.router.set(router).is_err() {
            tracing::warn!("BLE channel is already bound to a client");
        }
    }

    async fn start_discovery(&self) -> TransportResult<()> {
        let peripherals = self.adapter.scan(self.scan_timeout).await?;
        tracing::debug!("BLE scan found {} peripheral(s)", peripherals.len());

        let Some(me) = self.me.upgrade() else {
            return Ok(());
        };

        let mut probes = JoinSet::new();
        for peripheral in peripherals {
            probes.spawn(me.clone().probe(Arc::new(peripheral)));
        }
        while let Some(result) = probes.join_next().await {
            if let Err(e) = result {
                tracing::warn!("BLE probe task failed: {}", e);
            }
        }
        Ok(())
    }

    fn devices(&self) -> &DeviceTable {
        &self.devices
    }
}

impl<A: GattAdapter> Transport for BleChannel<A> {
    type Meta = Arc<A::Peripheral>;

    fn router(&self) -> Option<&SessionRouter> {
        self.router.get()
    }

    fn register_device(&self, info: DiscoveryData, peripheral: Arc<A::Peripheral>) {
        let channel = self.me.clone();
        let source = Arc::downgrade(&peripheral);
        let notify: NotifyCallback = Arc::new(move |data: &[u8]| {
            if let (Some(channel), Some(source)) = (channel.upgrade(), source.upgrade()) {
                channel.dispatch_inbound(data, source);
            }
        });

        let dev_id = info.dev_id.clone();
        let address = peripheral.address();
        let subscribed = self.subscription_state(&dev_id, &peripheral);
        let device = BleDevice {
            info,
            peripheral,
            notify,
            subscribed,
        };

        if self.devices.insert(Arc::new(device)) {
            tracing::info!(channel = "ble", "Discovered {} at {}", dev_id, address);
        } else {
            tracing::debug!(channel = "ble", "Refreshed {} at {}", dev_id, address);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::channel::TransportError;
    use crate::protocol::{decode_frame, encode_discovery_helo, encode_packet, Frame};
    use crate::Client;

    struct Inner {
        address: String,
        answer: Vec<u8>,
        reachable: bool,
        connected: AtomicBool,
        connects: AtomicUsize,
        subscriptions: AtomicUsize,
        callback: std::sync::Mutex<Option<NotifyCallback>>,
        written: std::sync::Mutex<Vec<(Uuid, Vec<u8>)>>,
    }

    /// Peripheral that answers probes with `answer` and echoes PINGs
    #[derive(Clone)]
    struct MockPeripheral(Arc<Inner>);

    impl MockPeripheral {
        fn new(address: &str, answer: Vec<u8>, reachable: bool) -> Self {
            Self(Arc::new(Inner {
                address: address.to_string(),
                answer,
                reachable,
                connected: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                subscriptions: AtomicUsize::new(0),
                callback: std::sync::Mutex::new(None),
                written: std::sync::Mutex::new(Vec::new()),
            }))
        }

        fn device(address: &str, dev_id: &str) -> Self {
            Self::new(address, encode_discovery_helo(&DiscoveryData::new("fw-ble", dev_id, 1)).to_vec(), true)
        }

        fn connected(&self) -> bool {
            self.0.connected.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GattPeripheral for MockPeripheral {
        fn address(&self) -> String {
            self.0.address.clone()
        }

        async fn is_connected(&self) -> bool {
            self.connected()
        }

        async fn connect(&self) -> TransportResult<()> {
            if !self.0.reachable {
                return Err(TransportError::Connection("out of range".to_string()));
            }
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            self.0.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> TransportResult<()> {
            self.0.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn write(&self, characteristic: Uuid, data: &[u8]) -> TransportResult<()> {
            self.0.written.lock().unwrap().push((characteristic, data.to_vec()));

            if let Ok(Frame::Session(packet)) = decode_frame(data) {
                let callback = self.0.callback.lock().unwrap().clone();
                if let (PacketType::Ping, Some(callback)) = (packet.kind, callback) {
                    callback(&encode_packet(&packet.reply(PacketType::Ping)));
                }
            }
            Ok(())
        }

        async fn read(&self, _characteristic: Uuid) -> TransportResult<Vec<u8>> {
            Ok(self.0.answer.clone())
        }

        async fn subscribe(&self, _characteristic: Uuid, callback: NotifyCallback) -> TransportResult<()> {
            self.0.subscriptions.fetch_add(1, Ordering::SeqCst);
            *self.0.callback.lock().unwrap() = Some(callback);
            Ok(())
        }
    }

    struct MockAdapter {
        peripherals: Vec<MockPeripheral>,
    }

    #[async_trait]
    impl GattAdapter for MockAdapter {
        type Peripheral = MockPeripheral;

        async fn scan(&self, _timeout: Duration) -> TransportResult<Vec<MockPeripheral>> {
            Ok(self.peripherals.clone())
        }
    }

    fn ble_client(peripherals: &[MockPeripheral]) -> (Client, Arc<BleChannel<MockAdapter>>) {
        let adapter = MockAdapter {
            peripherals: peripherals.to_vec(),
        };
        let channel = BleChannel::new(adapter, &BleConfig::default());
        let client = Client::new();
        client.add_channel(channel.clone());
        (client, channel)
    }

    #[test]
    fn test_nus_uuids() {
        assert_eq!(NUS_SERVICE_UUID.to_string(), "6e400001-b5a3-f393-e0a9-e50e24dcca9e");
        assert_eq!(NUS_WRITE_CHAR_UUID.to_string(), "6e400002-b5a3-f393-e0a9-e50e24dcca9e");
        assert_eq!(NUS_NOTIFY_CHAR_UUID.to_string(), "6e400003-b5a3-f393-e0a9-e50e24dcca9e");
    }

    #[tokio::test]
    async fn test_discovery_keeps_only_answering_peripherals() {
        let device = MockPeripheral::device("AA:01", "ble-dev");
        let mute = MockPeripheral::new("AA:02", Vec::new(), true);
        let stranger = MockPeripheral::new("AA:03", vec![0x09, 0x01], true);
        let gone = MockPeripheral::new("AA:04", Vec::new(), false);

        let (client, channel) = ble_client(&[device.clone(), mute.clone(), stranger.clone(), gone.clone()]);
        let found = client.discover_wait(Duration::ZERO).await;

        assert_eq!(found.len(), 1);
        assert!(found.contains("ble-dev"));
        assert_eq!(channel.devices().get("ble-dev").unwrap().address(), "AA:01");

        assert!(device.connected());
        assert!(!mute.connected());
        assert!(!stranger.connected());
        assert!(!gone.connected());

        let probe = device.0.written.lock().unwrap()[0].clone();
        assert_eq!(probe, (NUS_WRITE_CHAR_UUID, vec![0]));
    }

    #[tokio::test]
    async fn test_session_replies_arrive_as_notifications() {
        let device = MockPeripheral::device("AA:01", "ble-dev");
        let (client, _channel) = ble_client(&[device.clone()]);
        client.discover_wait(Duration::ZERO).await;

        let session = client.open_session("ble-dev").unwrap();
        assert!(session.ping().await.is_ok());
        assert!(session.ping().await.is_ok());

        assert_eq!(device.0.subscriptions.load(Ordering::SeqCst), 1);
        assert_eq!(device.0.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_reconnects_and_resubscribes() {
        let device = MockPeripheral::device("AA:01", "ble-dev");
        let (client, _channel) = ble_client(&[device.clone()]);
        client.discover_wait(Duration::ZERO).await;

        let session = client.open_session("ble-dev").unwrap();
        assert!(session.ping().await.is_ok());

        device.disconnect().await.unwrap();
        assert!(session.ping().await.is_ok());

        assert_eq!(device.0.connects.load(Ordering::SeqCst), 2);
        assert_eq!(device.0.subscriptions.load(Ordering::SeqCst), 2);
    }
    #[tokio::test]
    async fn test_helo_notification_keeps_subscription() {
        let device = MockPeripheral::device("AA:01", "ble-dev");
        let (client, channel) = ble_client(&[device.clone()]);
        client.discover_wait(Duration::ZERO).await;

        let session = client.open_session("ble-dev").unwrap();
        assert!(session.ping().await.is_ok());

        // Device announces itself again over the open link
        let notify = device.0.callback.lock().unwrap().clone().unwrap();
        notify(&device.0.answer[..]);
        assert!(channel.devices().contains("ble-dev"));

        assert!(session.ping().await.is_ok());
        assert_eq!(device.0.subscriptions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_new_peripheral_for_same_id_subscribes_again() {
        let first = MockPeripheral::device("AA:01", "ble-dev");
        let (client, channel) = ble_client(&[first.clone()]);
        client.discover_wait(Duration::ZERO).await;

        let session = client.open_session("ble-dev").unwrap();
        assert!(session.ping().await.is_ok());

        let second = MockPeripheral::device("AA:02", "ble-dev");
        second.connect().await.unwrap();
        channel.dispatch_inbound(&second.0.answer, Arc::new(second.clone()));

        assert!(session.ping().await.is_ok());
        assert_eq!(second.0.subscriptions.load(Ordering::SeqCst), 1);
        assert_eq!(channel.devices().get("ble-dev").unwrap().address(), "AA:02");
    }
}
