//! Network module - Concrete channel implementations
//!
//! Provides:
//! - UDP broadcast channel
//! - BLE channel over the Nordic UART service

mod ble;
mod udp;

pub use ble::*;
pub use udp::*;

use std::net::Ipv4Addr;

use crate::channel::{TransportError, TransportResult};

/// Broadcast address of an IPv4 subnet in CIDR notation
///
/// `192.168.1.0/24` gives `192.168.1.255`.
pub fn broadcast_address(subnet: &str) -> TransportResult<Ipv4Addr> {
    let invalid = || TransportError::InvalidSubnet(subnet.to_string());

    let (addr, prefix) = subnet.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.trim().parse().map_err(|_| invalid())?;
    let prefix: u32 = prefix.trim().parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }

    let host_mask = u32::MAX.checked_shr(prefix).unwrap_or(0);
    Ok(Ipv4Addr::from(u32::from(addr) | host_mask))
}
