//! Session module - Request/reply conversations with one device
//!
//! A session correlates requests and replies by nonce:
//! - PING and GET use a random nonce, so a device cannot tell a
//!   retransmitted GET from a new one
//! - SEND and POST use the session's ordered counter (starting at 1), so a
//!   device can drop duplicates and apply them in order
//!
//! GET and POST split the session timeout evenly across their attempts. One
//! completion handle stays registered for the whole call; a timeout only
//! resends the same bytes, and any reply to any attempt completes the call.

mod pending;

pub(crate) use pending::Reply;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::client::Registry;
use crate::config::SessionConfig;
use crate::protocol::{encode_packet, CodecError, Nonce, Packet, PacketType, SessionId};
use pending::{PendingGuard, PendingTable};

/// Request errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Request timed out")]
    TimedOut,

    #[error("Endpoint not found on device")]
    NotFound,

    #[error("Device not registered: {0}")]
    UnknownDevice(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] CodecError),

    #[error("Unexpected {0:?} reply")]
    UnexpectedReply(PacketType),

    #[error("{0:?} is still waiting for a reply")]
    NonceInUse(Nonce),
}

/// Random nonces are never drawn from this many values ahead of the ordered counter
const ORDERED_WINDOW: u32 = 1 << 16;

pub type RequestResult<T> = Result<T, RequestError>;

/// The part of a session the client's dispatch task can reach
pub(crate) struct SessionState {
    pub(crate) id: SessionId,
    pub(crate) dev_id: String,
    pending: PendingTable,
}

impl SessionState {
    pub(crate) fn new(id: SessionId, dev_id: impl Into<String>) -> Self {
        Self {
            id,
            dev_id: dev_id.into(),
            pending: PendingTable::default(),
        }
    }

    /// Resolve the request waiting on the packet's nonce, if any
    pub(crate) fn on_message(&self, packet: &Packet) -> bool {
        let Some(reply) = Reply::from_packet(packet) else {
            tracing::debug!(session = %self.id, "Ignoring {:?} packet", packet.kind);
            return false;
        };

        let resolved = self.pending.resolve(packet.nonce, reply);
        if !resolved {
            tracing::debug!(
                session = %self.id,
                nonce = ?packet.nonce,
                "Dropping unmatched {:?} reply",
                packet.kind
            );
        }
        resolved
    }

    #[cfg(test)]
    pub(crate) fn register(&self, nonce: Nonce) -> oneshot::Receiver<Reply> {
        self.pending.register(nonce)
    }
}

/// A conversation with one discovered device.
///
/// Obtained from [`Client::open_session`](crate::Client::open_session); the
/// session unregisters from its client when dropped.
pub struct Session {
    state: Arc<SessionState>,
    registry: Arc<Registry>,
    sequence: AtomicU32,
    config: SessionConfig,
}

impl Session {
    pub(crate) fn new(state: Arc<SessionState>, registry: Arc<Registry>, config: SessionConfig) -> Self {
        Self {
            state,
            registry,
            sequence: AtomicU32::new(1),
            config,
        }
    }

    pub fn id(&self) -> SessionId {
        self.state.id
    }

    pub fn dev_id(&self) -> &str {
        &self.state.dev_id
    }

    /// Total time budget of one request
    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Number of requests currently waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.state.pending.len()
    }

    /// Round trip time of one echo, waiting up to the full timeout
    pub async fn ping(&self) -> RequestResult<Duration> {
        let (nonce, rx) = self.register_random();
        let bytes = encode_packet(&Packet::new(PacketType::Ping, self.id(), nonce));

        let started = Instant::now();
        match self.exchange(nonce, rx, bytes, 1).await? {
            Reply::Pong => Ok(started.elapsed()),
            other => Err(RequestError::UnexpectedReply(other.kind())),
        }
    }

    /// Read `endpoint`, retransmitting up to the configured number of times
    pub async fn get(&self, endpoint: &str, data: &str) -> RequestResult<String> {
        self.get_with(endpoint, data, self.config.retransmits).await
    }

    /// Read `endpoint` with an explicit retransmission budget
    pub async fn get_with(&self, endpoint: &str, data: &str, retransmits: u32) -> RequestResult<String> {
        let payload = Packet::request_payload(endpoint, data)?;
        let (nonce, rx) = self.register_random();
        let bytes = encode_packet(&Packet::new(PacketType::Get, self.id(), nonce).with_payload(payload));

        match self.exchange(nonce, rx, bytes, retransmits).await? {
            Reply::Value(value) => Ok(value),
            other => Err(RequestError::UnexpectedReply(other.kind())),
        }
    }

    /// Fire-and-forget write, ordered with the session's other SEND/POST calls
    pub async fn send(&self, endpoint: &str, data: &str) -> RequestResult<()> {
        let payload = Packet::request_payload(endpoint, data)?;
        let nonce = self.next_nonce();
        let bytes = encode_packet(&Packet::new(PacketType::Send, self.id(), nonce).with_payload(payload));

        self.transmit(&bytes).await
    }

    /// Acknowledged write, retransmitting up to the configured number of times
    pub async fn post(&self, endpoint: &str, data: &str) -> RequestResult<()> {
        self.post_with(endpoint, data, self.config.retransmits).await
    }

    /// Acknowledged write with an explicit retransmission budget.
    ///
    /// Every attempt carries the same ordered nonce, so a device that drops
    /// duplicate nonces applies the write once.
    pub async fn post_with(&self, endpoint: &str, data: &str, retransmits: u32) -> RequestResult<()> {
        let payload = Packet::request_payload(endpoint, data)?;
        let nonce = self.next_nonce();
        let rx = self
            .state
            .pending
            .try_register(nonce)
            .ok_or(RequestError::NonceInUse(nonce))?;
        let bytes = encode_packet(&Packet::new(PacketType::Post, self.id(), nonce).with_payload(payload));

        match self.exchange(nonce, rx, bytes, retransmits).await? {
            Reply::Ack => Ok(()),
            other => Err(RequestError::UnexpectedReply(other.kind())),
        }
    }

    /// Unregister from the client
    pub fn close(self) {}

    fn next_nonce(&self) -> Nonce {
        Nonce::from_sequence(self.sequence.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether `nonce` is one the ordered counter will hand out soon
    fn reserved_for_ordered(&self, nonce: Nonce) -> bool {
        let next = self.sequence.load(Ordering::Relaxed);
        nonce.as_u32().wrapping_sub(next) < ORDERED_WINDOW
    }

    fn register_random(&self) -> (Nonce, oneshot::Receiver<Reply>) {
        loop {
            let nonce = Nonce::random();
            if self.reserved_for_ordered(nonce) {
                continue;
            }
            if let Some(rx) = self.state.pending.try_register(nonce) {
                return (nonce, rx);
            }
        }
    }

    /// Send `bytes` until the handle registered under `nonce` resolves or
    /// every attempt has timed out.
    async fn exchange(
        &self,
        nonce: Nonce,
        mut rx: oneshot::Receiver<Reply>,
        bytes: Bytes,
        attempts: u32,
    ) -> RequestResult<Reply> {
        let _guard = PendingGuard::new(&self.state.pending, nonce);

        let attempts = attempts.max(1);
        let per_attempt = self.config.timeout() / attempts;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tracing::debug!(session = %self.id(), ?nonce, attempt, "Retransmitting");
            }

            self.transmit(&bytes).await?;

            match tokio::time::timeout(per_attempt, &mut rx).await {
                Ok(Ok(Reply::NotFound)) => return Err(RequestError::NotFound),
                Ok(Ok(reply)) => return Ok(reply),
                // Handle dropped without a reply
                Ok(Err(_)) => break,
                Err(_) => {}
            }
        }

        tracing::debug!(session = %self.id(), ?nonce, "Request timed out");
        Err(RequestError::TimedOut)
    }

    /// Write through the device currently registered under this session's id.
    /// Transport failures count as a lost attempt.
    async fn transmit(&self, bytes: &[u8]) -> RequestResult<()> {
        let device = self
            .registry
            .device(&self.state.dev_id)
            .ok_or_else(|| RequestError::UnknownDevice(self.state.dev_id.clone()))?;

        if let Err(e) = device.send(bytes).await {
            tracing::warn!(device = %self.state.dev_id, "Send failed: {}", e);
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.registry.remove_session(self.state.id);
        tracing::info!(session = %self.state.id, device = %self.state.dev_id, "Session closed");
    }
}
