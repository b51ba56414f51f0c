//! Multicom Client
//!
//! Aggregates channels, owns the session registry and demultiplexes every
//! inbound session packet to the session it belongs to.
//!
//! Inbound frames from all channels are queued through a [`SessionRouter`]
//! and consumed by a single dispatch task, which is the only place pending
//! requests get resolved.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::channel::{Channel, Device, SessionRouter};
use crate::config::SessionConfig;
use crate::protocol::{decode_frame, CodecError, Frame, PacketType, SessionId};
use crate::session::{Session, SessionState};

/// Client errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Device not found: {0}")]
    UnknownDevice(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// State shared between the client, its sessions and the dispatch task
#[derive(Default)]
pub(crate) struct Registry {
    channels: RwLock<Vec<Arc<dyn Channel>>>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionState>>>,
}

impl Registry {
    fn channels(&self) -> Vec<Arc<dyn Channel>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<SessionState>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// First device registered under `dev_id`, searching channels in the
    /// order they were added
    pub(crate) fn device(&self, dev_id: &str) -> Option<Arc<dyn Device>> {
        self.channels().iter().find_map(|c| c.devices().get(dev_id))
    }

    pub(crate) fn remove_session(&self, id: SessionId) -> bool {
        self.sessions().remove(&id).is_some()
    }

    /// Deliver one session frame
    fn route(&self, bytes: &[u8]) -> Result<PacketType, CodecError> {
        let packet = match decode_frame(bytes)? {
            Frame::Session(packet) => packet,
            other => {
                tracing::debug!("Ignoring {:?} frame on the session path", other.kind());
                return Ok(other.kind());
            }
        };

        let session = self.sessions().get(&packet.session).cloned();
        match session {
            Some(session) => {
                session.on_message(&packet);
            }
            None => tracing::debug!(session = %packet.session, "Dropping {:?} for unknown session", packet.kind),
        }

        Ok(packet.kind)
    }
}

/// Multicom Client
pub struct Client {
    registry: Arc<Registry>,
    router: SessionRouter,
    dispatcher: JoinHandle<()>,
    session_config: SessionConfig,
}

impl Client {
    /// Create a client with default session settings.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        Self::with_session_config(SessionConfig::default())
    }

    /// Create a client whose sessions use `session_config`
    pub fn with_session_config(session_config: SessionConfig) -> Self {
        let registry = Arc::new(Registry::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch_loop(Arc::downgrade(&registry), rx));

        Self {
            registry,
            router: SessionRouter::new(tx),
            dispatcher,
            session_config,
        }
    }

    /// Register a transport and bind it to this client
    pub fn add_channel(&self, channel: Arc<dyn Channel>) {
        channel.bind(self.router.clone());
        tracing::info!(channel = channel.name(), "Channel added");
        self.registry
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(channel);
    }

    /// Number of registered channels
    pub fn channel_count(&self) -> usize {
        self.registry.channels.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Route one session frame synchronously.
    ///
    /// Channels normally go through their router; this is the same routine
    /// the dispatch task runs.
    pub fn on_message(&self, bytes: &[u8]) -> Result<PacketType, CodecError> {
        self.registry.route(bytes)
    }

    /// Run discovery on every channel concurrently and wait for all of them
    /// and for `window` to elapse. Returns the ids known on any channel.
    pub async fn discover_wait(&self, window: Duration) -> HashSet<String> {
        let mut tasks = JoinSet::new();

        for channel in self.registry.channels() {
            tasks.spawn(async move {
                if let Err(e) = channel.start_discovery().await {
                    tracing::warn!(channel = channel.name(), "Discovery failed: {}", e);
                }
            });
        }
        tasks.spawn(tokio::time::sleep(window));

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::warn!("Discovery task failed: {}", e);
            }
        }

        let devices = self.device_ids();
        tracing::info!("Discovery finished, {} device(s) known", devices.len());
        devices
    }

    /// Union of the device ids known on all channels
    pub fn device_ids(&self) -> HashSet<String> {
        self.registry
            .channels()
            .iter()
            .flat_map(|c| c.devices().ids())
            .collect()
    }

    /// Look up a raw device by id
    pub fn device(&self, dev_id: &str) -> Option<Arc<dyn Device>> {
        self.registry.device(dev_id)
    }

    /// Forget devices not seen for at least `max_age`, returning their ids
    pub fn evict_stale_devices(&self, max_age: Duration) -> Vec<String> {
        let evicted: Vec<String> = self
            .registry
            .channels()
            .iter()
            .flat_map(|c| c.devices().evict_older_than(max_age))
            .collect();

        if !evicted.is_empty() {
            tracing::info!("Evicted stale devices: {:?}", evicted);
        }
        evicted
    }

    /// Open a session with a discovered device.
    ///
    /// The session unregisters itself when dropped.
    pub fn open_session(&self, dev_id: &str) -> ClientResult<Session> {
        if self.device(dev_id).is_none() {
            return Err(ClientError::UnknownDevice(dev_id.to_string()));
        }

        let state = {
            let mut sessions = self.registry.sessions();
            let id = loop {
                let id = SessionId::random();
                if !sessions.contains_key(&id) {
                    break id;
                }
            };

            let state = Arc::new(SessionState::new(id, dev_id));
            sessions.insert(id, state.clone());
            state
        };

        tracing::info!(session = %state.id, device = dev_id, "Session opened");
        Ok(Session::new(state, self.registry.clone(), self.session_config.clone()))
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        self.registry.sessions().len()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch_loop(registry: Weak<Registry>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };

        if let Err(e) = registry.route(&frame) {
            tracing::debug!("Dropping inbound frame: {}", e);
        }
    }
}
