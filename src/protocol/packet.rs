//! Packet definitions
//!
//! Defines the packet types, identifiers and the typed packet view shared by
//! the codec, the sessions and the client.

use std::fmt;

use bytes::{Bytes, BytesMut, BufMut};

use super::CodecError;

/// Packet type identifiers, one byte on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Discovery probe, only answered with a HELO
    Discovery = 0,
    /// Discovery reply carrying the device identity
    DiscoveryHelo = 1,
    /// Echo
    Ping = 2,
    /// Request with a random nonce, may run more than once on the device
    Get = 3,
    /// Reply to a GET
    GetReply = 4,
    /// Fire-and-forget request with the ordered nonce
    Send = 5,
    /// Acknowledged request with the ordered nonce
    Post = 6,
    /// Reply to a POST
    Ack = 7,
    /// The addressed endpoint does not exist
    NotFound = 8,
}

impl PacketType {
    /// Wire code of this packet type
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether packets of this type carry a session id and nonce
    pub fn has_session_header(self) -> bool {
        !matches!(self, PacketType::Discovery | PacketType::DiscoveryHelo)
    }

    /// Whether this type can resolve a pending request
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            PacketType::Ping | PacketType::GetReply | PacketType::Ack | PacketType::NotFound
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PacketType::Discovery,
            1 => PacketType::DiscoveryHelo,
            2 => PacketType::Ping,
            3 => PacketType::Get,
            4 => PacketType::GetReply,
            5 => PacketType::Send,
            6 => PacketType::Post,
            7 => PacketType::Ack,
            8 => PacketType::NotFound,
            other => return Err(CodecError::UnknownType(other)),
        })
    }
}

/// Identifier of one conversation, used to route replies to their session
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 4]);

impl SessionId {
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Draw a random session id
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", u32::from_be_bytes(self.0))
    }
}

/// Request/reply correlation value
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; 4]);

impl Nonce {
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Draw a random nonce (PING and GET)
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Nonce taken from a session's ordered counter (SEND and POST)
    pub fn from_sequence(sequence: u32) -> Self {
        Self(sequence.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Big-endian integer value, meaningful for ordered nonces
    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({:08x})", self.as_u32())
    }
}

/// A session packet: every type except the two discovery types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub session: SessionId,
    pub nonce: Nonce,
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet with an empty payload
    pub fn new(kind: PacketType, session: SessionId, nonce: Nonce) -> Self {
        Self {
            kind,
            session,
            nonce,
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Build a GET/SEND/POST packet: `endpoint`, NUL, then `data`
    pub fn request(
        kind: PacketType,
        session: SessionId,
        nonce: Nonce,
        endpoint: &str,
        data: &str,
    ) -> Result<Self, CodecError> {
        let payload = Self::request_payload(endpoint, data)?;
        Ok(Self::new(kind, session, nonce).with_payload(payload))
    }

    /// Request payload on its own, so callers can validate before picking a nonce
    pub fn request_payload(endpoint: &str, data: &str) -> Result<Bytes, CodecError> {
        if !endpoint.is_ascii() || !data.is_ascii() {
            return Err(CodecError::NotAscii);
        }

        let mut payload = BytesMut::with_capacity(endpoint.len() + 1 + data.len());
        payload.put_slice(endpoint.as_bytes());
        payload.put_u8(0);
        payload.put_slice(data.as_bytes());
        Ok(payload.freeze())
    }

    /// Split a request payload into endpoint and data.
    /// A payload without a NUL is all endpoint.
    pub fn endpoint_and_data(&self) -> (&[u8], &[u8]) {
        match self.payload.iter().position(|b| *b == 0) {
            Some(i) => (&self.payload[..i], &self.payload[i + 1..]),
            None => (&self.payload[..], &[]),
        }
    }

    /// First NUL-delimited field of a GET_REPLY payload
    pub fn reply_value(&self) -> String {
        let first = self
            .payload
            .split(|b| *b == 0)
            .next()
            .unwrap_or_default();
        String::from_utf8_lossy(first).into_owned()
    }

    /// Build a reply addressed to the same session and nonce as this packet
    pub fn reply(&self, kind: PacketType) -> Packet {
        Packet::new(kind, self.session, self.nonce)
    }
}
