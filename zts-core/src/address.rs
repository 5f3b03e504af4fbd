//! Deterministic IPv6 address derivation from (network id, node id).
//!
//! Pure address-space arithmetic: callable whether or not the service runs.

use std::net::Ipv6Addr;

use crate::model::{NetworkId, NodeId};

/// Prefix length of a 6PLANE address.
pub const SIXPLANE_PREFIX_LEN: u8 = 40;

/// Prefix length of an RFC4193 address.
pub const RFC4193_PREFIX_LEN: u8 = 88;

/// 6PLANE: `fc` + (nwid folded to 32 bits) + node id + `::1`.
pub fn sixplane_address(nwid: NetworkId, node: NodeId) -> Ipv6Addr {
    let folded = (nwid.0 ^ (nwid.0 >> 32)) as u32;
    let mut b = [0u8; 16];
    b[0] = 0xfc;
    b[1..5].copy_from_slice(&folded.to_be_bytes());
    b[5..10].copy_from_slice(&node.to_bytes());
    b[15] = 0x01;
    Ipv6Addr::from(b)
}

/// RFC4193: `fd` + nwid + `99 93` + node id.
pub fn rfc4193_address(nwid: NetworkId, node: NodeId) -> Ipv6Addr {
    let mut b = [0u8; 16];
    b[0] = 0xfd;
    b[1..9].copy_from_slice(&nwid.0.to_be_bytes());
    b[9] = 0x99;
    b[10] = 0x93;
    b[11..16].copy_from_slice(&node.to_bytes());
    Ipv6Addr::from(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NWID: NetworkId = NetworkId(0x8056_c2e2_1c00_0001);
    const NODE: NodeId = NodeId(0xab_cdef_0123);

    #[test]
    fn rfc4193_layout() {
        let expected: Ipv6Addr = "fd80:56c2:e21c:0000:0199:93ab:cdef:0123".parse().unwrap();
        assert_eq!(rfc4193_address(NWID, NODE), expected);
    }

    #[test]
    fn sixplane_layout() {
        let expected: Ipv6Addr = "fc9c:56c2:e3ab:cdef:0123::1".parse().unwrap();
        assert_eq!(sixplane_address(NWID, NODE), expected);
    }

    #[test]
    fn derivation_is_deterministic_and_node_specific() {
        let other = NodeId(0x11_2233_4455);
        assert_eq!(rfc4193_address(NWID, NODE), rfc4193_address(NWID, NODE));
        assert_ne!(rfc4193_address(NWID, NODE), rfc4193_address(NWID, other));
        assert_ne!(sixplane_address(NWID, NODE), sixplane_address(NWID, other));
    }
}
