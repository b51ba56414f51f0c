//! Discovery reply payload parsing
//!
//! A device answers a discovery probe with `fw_id\0dev_id\0api_ver`.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Discovery payload errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Discovery payload is not ASCII")]
    NotAscii,

    #[error("Expected 3 discovery fields, got {0}")]
    FieldCount(usize),

    #[error("Empty device id")]
    EmptyDeviceId,

    #[error("Invalid api version: {0:?}")]
    ApiVersion(String),
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Identity a device reports in its discovery reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryData {
    /// Firmware identifier
    pub fw_id: String,
    /// Device identifier, the key devices are stored under
    pub dev_id: String,
    /// Protocol api version implemented by the firmware
    pub api_ver: u32,
}

impl DiscoveryData {
    pub fn new(fw_id: impl Into<String>, dev_id: impl Into<String>, api_ver: u32) -> Self {
        Self {
            fw_id: fw_id.into(),
            dev_id: dev_id.into(),
            api_ver,
        }
    }

    /// Parse a DISCOVERY_HELO payload (the bytes after the type byte)
    pub fn parse(payload: &[u8]) -> ParseResult<Self> {
        if !payload.is_ascii() {
            return Err(ParseError::NotAscii);
        }

        // Tolerate a trailing NUL terminator
        let payload = payload.strip_suffix(b"\0").unwrap_or(payload);

        let fields: Vec<&[u8]> = payload.split(|b| *b == 0).collect();
        let [fw_id, dev_id, api_ver] = fields[..] else {
            return Err(ParseError::FieldCount(fields.len()));
        };

        if dev_id.is_empty() {
            return Err(ParseError::EmptyDeviceId);
        }

        // Payload is ASCII, so these conversions are lossless
        let api_ver = String::from_utf8_lossy(api_ver);
        let api_ver = api_ver
            .parse::<u32>()
            .map_err(|_| ParseError::ApiVersion(api_ver.to_string()))?;

        Ok(Self {
            fw_id: String::from_utf8_lossy(fw_id).into_owned(),
            dev_id: String::from_utf8_lossy(dev_id).into_owned(),
            api_ver,
        })
    }

    /// Encode as a DISCOVERY_HELO payload
    pub fn to_payload(&self) -> Bytes {
        let api_ver = self.api_ver.to_string();
        let mut buf = BytesMut::with_capacity(self.fw_id.len() + self.dev_id.len() + api_ver.len() + 2);
        buf.put_slice(self.fw_id.as_bytes());
        buf.put_u8(0);
        buf.put_slice(self.dev_id.as_bytes());
        buf.put_u8(0);
        buf.put_slice(api_ver.as_bytes());
        buf.freeze()
    }
}

impl fmt::Display for DiscoveryData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(fw_id: {:?}, dev_id: {:?}, api_ver: {})",
            self.fw_id, self.dev_id, self.api_ver
        )
    }
}
