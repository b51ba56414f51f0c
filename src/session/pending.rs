//! Outstanding requests of one session, keyed by nonce

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::protocol::{Nonce, Packet, PacketType};

/// What a matching reply resolves a waiting request with
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reply {
    Pong,
    Ack,
    Value(String),
    NotFound,
}

impl Reply {
    /// Interpret a reply packet. Request types never resolve anything.
    pub(crate) fn from_packet(packet: &Packet) -> Option<Self> {
        match packet.kind {
            PacketType::Ping => Some(Reply::Pong),
            PacketType::Ack => Some(Reply::Ack),
            PacketType::GetReply => Some(Reply::Value(packet.reply_value())),
            PacketType::NotFound => Some(Reply::NotFound),
            _ => None,
        }
    }

    pub(crate) fn kind(&self) -> PacketType {
        match self {
            Reply::Pong => PacketType::Ping,
            Reply::Ack => PacketType::Ack,
            Reply::Value(_) => PacketType::GetReply,
            Reply::NotFound => PacketType::NotFound,
        }
    }
}

/// Completion handles of in-flight requests.
///
/// An entry leaves the table exactly once: resolved by a reply, or
/// discarded by the waiting side when it gives up.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<Nonce, oneshot::Sender<Reply>>>,
}

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<Nonce, oneshot::Sender<Reply>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handle under `nonce`, replacing any previous one
    #[cfg(test)]
    pub(crate) fn register(&self, nonce: Nonce) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(nonce, tx);
        rx
    }

    /// Register a handle only if `nonce` is free
    pub(crate) fn try_register(&self, nonce: Nonce) -> Option<oneshot::Receiver<Reply>> {
        match self.lock().entry(nonce) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                Some(rx)
            }
        }
    }

    /// Complete the request waiting on `nonce`. Returns false if nothing was waiting.
    pub(crate) fn resolve(&self, nonce: Nonce, reply: Reply) -> bool {
        let Some(tx) = self.lock().remove(&nonce) else {
            return false;
        };
        tx.send(reply).is_ok()
    }

    /// Forget the request waiting on `nonce`
    pub(crate) fn discard(&self, nonce: Nonce) -> bool {
        self.lock().remove(&nonce).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Discards its nonce from the table when dropped
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    nonce: Nonce,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingTable, nonce: Nonce) -> Self {
        Self { table, nonce }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.discard(self.nonce);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionId;

    #[test]
    fn test_reply_from_packet() {
        let base = Packet::new(PacketType::Ping, SessionId::from_bytes([0; 4]), Nonce::from_sequence(1));
        assert_eq!(Reply::from_packet(&base), Some(Reply::Pong));

        let value = Packet { kind: PacketType::GetReply, ..base.clone() }.with_payload(&b"21\0"[..]);
        assert_eq!(Reply::from_packet(&value), Some(Reply::Value("21".to_string())));

        let request = Packet { kind: PacketType::Get, ..base };
        assert_eq!(Reply::from_packet(&request), None);
    }

    #[tokio::test]
    async fn test_resolve_once() {
        let table = PendingTable::default();
        let nonce = Nonce::from_sequence(5);
        let rx = table.register(nonce);

        assert!(table.resolve(nonce, Reply::Ack));
        assert!(!table.resolve(nonce, Reply::Ack));
        assert!(!table.discard(nonce));
        assert_eq!(rx.await.unwrap(), Reply::Ack);
    }

    #[test]
    fn test_try_register_refuses_taken_nonce() {
        let table = PendingTable::default();
        let nonce = Nonce::from_sequence(1);

        let _rx = table.try_register(nonce).unwrap();
        assert!(table.try_register(nonce).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_guard_discards() {
        let table = PendingTable::default();
        let nonce = Nonce::from_sequence(3);
        let _rx = table.register(nonce);

        {
            let _guard = PendingGuard::new(&table, nonce);
        }
        assert_eq!(table.len(), 0);
    }
}
