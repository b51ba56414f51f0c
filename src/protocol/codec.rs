//! Protocol codec for encoding/decoding packets
//!
//! Handles the byte layout of datagrams. There is no framing: each transport
//! frame carries exactly one packet.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{DiscoveryData, Nonce, Packet, PacketType, SessionId};

/// Header size of session packets: type(1) + session id(4) + nonce(4) = 9 bytes
pub const HEADER_SIZE: usize = 9;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty packet")]
    Empty,

    #[error("Unknown packet type: {0}")]
    UnknownType(u8),

    #[error("Truncated {kind:?} packet: {len} bytes")]
    Truncated { kind: PacketType, len: usize },

    #[error("Endpoint and data must be ASCII")]
    NotAscii,
}

/// A decoded datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Discovery probe
    Discovery,
    /// Discovery reply, payload still unparsed
    DiscoveryHelo(Bytes),
    /// Any packet addressed to a session
    Session(Packet),
}

impl Frame {
    pub fn kind(&self) -> PacketType {
        match self {
            Frame::Discovery => PacketType::Discovery,
            Frame::DiscoveryHelo(_) => PacketType::DiscoveryHelo,
            Frame::Session(packet) => packet.kind,
        }
    }
}

/// Encode a session packet
pub fn encode_packet(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + packet.payload.len());
    buf.put_u8(packet.kind.code());
    buf.put_slice(packet.session.as_bytes());
    buf.put_slice(packet.nonce.as_bytes());
    buf.put_slice(&packet.payload);
    buf.freeze()
}

/// The discovery probe: a single zero byte
pub fn encode_discovery_probe() -> Bytes {
    Bytes::from_static(&[0x00])
}

/// Encode the reply a device sends to a discovery probe
pub fn encode_discovery_helo(data: &DiscoveryData) -> Bytes {
    let payload = data.to_payload();
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(PacketType::DiscoveryHelo.code());
    buf.put_slice(&payload);
    buf.freeze()
}

/// Read the packet type without decoding the rest
pub fn peek_type(bytes: &[u8]) -> Result<PacketType, CodecError> {
    let first = bytes.first().ok_or(CodecError::Empty)?;
    PacketType::try_from(*first)
}

/// Decode one datagram
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    let kind = peek_type(bytes)?;

    match kind {
        PacketType::Discovery => Ok(Frame::Discovery),
        PacketType::DiscoveryHelo => Ok(Frame::DiscoveryHelo(Bytes::copy_from_slice(&bytes[1..]))),
        _ => {
            if bytes.len() < HEADER_SIZE {
                return Err(CodecError::Truncated {
                    kind,
                    len: bytes.len(),
                });
            }

            let session = SessionId::from_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
            let nonce = Nonce::from_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);

            Ok(Frame::Session(
                Packet::new(kind, session, nonce)
                    .with_payload(Bytes::copy_from_slice(&bytes[HEADER_SIZE..])),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId::from_bytes([0xde, 0xad, 0xbe, 0xef])
    }

    #[test]
    fn test_encode_layout() {
        let packet = Packet::request(
            PacketType::Get,
            session(),
            Nonce::from_bytes([1, 2, 3, 4]),
            "getval",
            "",
        )
        .unwrap();

        let bytes = encode_packet(&packet);
        assert_eq!(
            &bytes[..],
            &[3, 0xde, 0xad, 0xbe, 0xef, 1, 2, 3, 4, b'g', b'e', b't', b'v', b'a', b'l', 0]
        );
    }

    #[test]
    fn test_decode_ping_without_payload() {
        let packet = Packet::new(PacketType::Ping, session(), Nonce::from_sequence(9));
        let frame = decode_frame(&encode_packet(&packet)).unwrap();
        assert_eq!(frame, Frame::Session(packet));
        assert_eq!(frame.kind(), PacketType::Ping);
    }

    #[test]
    fn test_decode_discovery_frames() {
        assert_eq!(decode_frame(&encode_discovery_probe()).unwrap(), Frame::Discovery);

        let helo = decode_frame(b"\x01fw1\0dev-a\x003").unwrap();
        assert_eq!(helo, Frame::DiscoveryHelo(Bytes::from_static(b"fw1\0dev-a\x003")));
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode_frame(&[]), Err(CodecError::Empty));
        assert_eq!(decode_frame(&[42, 0, 0]), Err(CodecError::UnknownType(42)));
        assert_eq!(
            decode_frame(&[7, 1, 2, 3, 4, 0, 0]),
            Err(CodecError::Truncated {
                kind: PacketType::Ack,
                len: 7
            })
        );
    }

    #[test]
    fn test_helo_encoder_matches_parser() {
        let data = DiscoveryData::new("fw-2.1", "sensor-7", 2);
        let bytes = encode_discovery_helo(&data);
        assert_eq!(peek_type(&bytes).unwrap(), PacketType::DiscoveryHelo);
        assert_eq!(DiscoveryData::parse(&bytes[1..]).unwrap(), data);
    }
}
