//! 64-bit identities derived from socket addresses.
//!
//! A messaging system identifies a remote peer by the address its primary
//! connection originates from. The encoding packs the IPv4 octets into the
//! high 32 bits and the port into bits 31..16, so the value is stable for
//! the life of the connection and can be decoded back for diagnostics.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Encode a socket address as a 64-bit id.
///
/// IPv6 addresses are XOR-folded to four octets first, which keeps ids
/// unique for practical deployments but is not reversible.
pub fn address_id(addr: SocketAddr) -> i64 {
    let octets = match addr.ip() {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(v6) => {
            let raw = v6.octets();
            let mut folded = [0u8; 4];
            for (i, byte) in raw.iter().enumerate() {
                folded[i % 4] ^= byte;
            }
            folded
        }
    };

    let mut id: u64 = 0;
    for (i, octet) in octets.iter().enumerate() {
        id |= u64::from(*octet) << (8 * (7 - i));
    }
    id |= u64::from(addr.port()) << 16;
    id as i64
}

/// Decode an id produced by [`address_id`] for an IPv4 address.
///
/// Returns `None` when the address part is zero.
pub fn parse_address_id(id: i64) -> Option<SocketAddr> {
    let id = id as u64;
    if (id >> 32) == 0 {
        return None;
    }
    let ip = Ipv4Addr::from(((id >> 32) as u32).to_be_bytes());
    let port = ((id & 0x0000_0000_FFFF_0000) >> 16) as u16;
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}
