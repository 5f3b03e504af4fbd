//! Shared value types: network/node ids, address and route records, peer
//! snapshots, event codes and the socket-level ABI constants.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::ZtsError;

/// Default overlay port handed to `start` when the caller has no preference.
pub const DEFAULT_PORT: u16 = 9994;

/// Maximum address assignments per network.
pub const MAX_ASSIGNED_ADDRESSES: usize = 16;

/// Maximum routes per network.
pub const MAX_NETWORK_ROUTES: usize = 32;

/// Maximum number of direct physical paths reported per peer.
pub const MAX_PEER_NETWORK_PATHS: usize = 16;

/// 64-bit virtual network id, written as 16 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkId(pub u64);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for NetworkId {
    type Err = ZtsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches("0x");
        if s.is_empty() || s.len() > 16 {
            return Err(ZtsError::InvalidArgument("network id must be 1-16 hex digits"));
        }
        u64::from_str_radix(s, 16)
            .map(NetworkId)
            .map_err(|_| ZtsError::InvalidArgument("network id must be hex"))
    }
}

/// 40-bit overlay node address, written as 10 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const MASK: u64 = 0xff_ffff_ffff;

    pub fn from_bytes(b: &[u8; 5]) -> Self {
        NodeId(
            (u64::from(b[0]) << 32)
                | (u64::from(b[1]) << 24)
                | (u64::from(b[2]) << 16)
                | (u64::from(b[3]) << 8)
                | u64::from(b[4]),
        )
    }

    pub fn to_bytes(self) -> [u8; 5] {
        let v = self.0 & Self::MASK;
        [
            (v >> 32) as u8,
            (v >> 24) as u8,
            (v >> 16) as u8,
            (v >> 8) as u8,
            v as u8,
        ]
    }

    /// Zero and ids starting with 0xff are reserved.
    pub fn is_reserved(self) -> bool {
        self.0 == 0 || (self.0 >> 32) as u8 == 0xff || self.0 > Self::MASK
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

/// Address family of a socket or an address query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    pub fn from_raw(family: i32) -> Option<Self> {
        match family {
            AF_INET => Some(AddressFamily::Inet),
            AF_INET6 => Some(AddressFamily::Inet6),
            _ => None,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            AddressFamily::Inet => AF_INET,
            AddressFamily::Inet6 => AF_INET6,
        }
    }

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    pub fn matches(self, addr: &SocketAddr) -> bool {
        AddressFamily::of(&addr.ip()) == self
    }
}

/// An address assigned to this node on a virtual network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRecord {
    pub ip: IpAddr,
    pub prefix_len: u8,
}

impl AddressRecord {
    pub fn new(ip: IpAddr, prefix_len: u8) -> Self {
        Self { ip, prefix_len }
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.ip)
    }

    /// Whether `other` falls in this address's subnet.
    pub fn contains(&self, other: &IpAddr) -> bool {
        prefix_match(&self.ip, other, self.prefix_len)
    }
}

/// A managed route pushed by the network controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub target: IpAddr,
    pub prefix_len: u8,
    /// Gateway, or `None` for LAN-local.
    pub via: Option<IpAddr>,
    pub flags: u16,
    pub metric: u16,
}

impl RouteRecord {
    pub fn contains(&self, other: &IpAddr) -> bool {
        prefix_match(&self.target, other, self.prefix_len)
    }
}

pub(crate) fn prefix_match(net: &IpAddr, other: &IpAddr, prefix_len: u8) -> bool {
    match (net, other) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            let bits = u32::from(prefix_len.min(32));
            if bits == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - bits);
            (u32::from(*a) & mask) == (u32::from(*b) & mask)
        }
        (IpAddr::V6(a), IpAddr::V6(b)) => {
            let bits = u32::from(prefix_len.min(128));
            if bits == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - bits);
            (u128::from(*a) & mask) == (u128::from(*b) & mask)
        }
        _ => false,
    }
}

/// Controller-reported state of a network membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    RequestingConfiguration,
    Ok,
    AccessDenied,
    NotFound,
    ClientTooOld,
    Down,
}

/// Configuration the controller hands a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub mtu: u32,
    pub addresses: Vec<AddressRecord>,
    pub routes: Vec<RouteRecord>,
}

/// One joined network as seen by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRecord {
    pub id: NetworkId,
    pub name: String,
    pub joined_at: SystemTime,
    pub status: NetworkStatus,
    pub ready: bool,
    pub mtu: u32,
    /// Insertion order is preserved; `get_address` relies on it.
    pub addresses: Vec<AddressRecord>,
    pub routes: Vec<RouteRecord>,
}

/// Trust-hierarchy role of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    Leaf = 0,
    Moon = 1,
    Planet = 2,
}

/// How a peer is currently reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    Direct,
    Relayed,
    Unreachable,
}

impl PeerStatus {
    pub fn event_code(self) -> EventCode {
        match self {
            PeerStatus::Direct => EventCode::PeerP2p,
            PeerStatus::Relayed => EventCode::PeerRelay,
            PeerStatus::Unreachable => EventCode::PeerUnreachable,
        }
    }
}

/// Physical network path to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalPath {
    pub address: SocketAddr,
    /// Milliseconds since the epoch, 0 for never.
    pub last_send: u64,
    pub last_receive: u64,
    pub trusted_path_id: u64,
    pub expired: bool,
    pub preferred: bool,
}

/// Snapshot of a peer produced on demand by the overlay core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub role: PeerRole,
    /// (major, minor, revision), `None` when unknown.
    pub version: Option<(u32, u32, u32)>,
    /// Last measured latency in milliseconds, `None` when unknown.
    pub latency_ms: Option<u32>,
    pub paths: Vec<PhysicalPath>,
}

/// Event codes delivered to the application callback. The integer values are
/// an ABI contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EventCode {
    None = -1,
    NodeUp = 0,
    NodeOffline = 1,
    NodeOnline = 2,
    NodeDown = 3,
    NodeIdentityCollision = 4,
    NodeUnrecoverableError = 16,
    NodeNormalTermination = 17,
    NetworkNotFound = 32,
    NetworkClientTooOld = 33,
    NetworkRequestingConfig = 34,
    NetworkOk = 35,
    NetworkAccessDenied = 36,
    NetworkReadyIp4 = 37,
    NetworkReadyIp6 = 38,
    NetworkDown = 39,
    NetworkStackUp = 48,
    NetworkStackDown = 49,
    NetifUpIp4 = 64,
    NetifUpIp6 = 65,
    NetifDownIp4 = 66,
    NetifDownIp6 = 67,
    NetifRemoved = 68,
    NetifLinkUp = 69,
    NetifLinkDown = 70,
    NetifNewAddress = 71,
    PeerP2p = 96,
    PeerRelay = 97,
    PeerUnreachable = 98,
}

/// Coarse grouping of event codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    None,
    Node,
    Network,
    Stack,
    Netif,
    Peer,
}

impl EventCode {
    pub const ALL: [EventCode; 29] = [
        EventCode::None,
        EventCode::NodeUp,
        EventCode::NodeOffline,
        EventCode::NodeOnline,
        EventCode::NodeDown,
        EventCode::NodeIdentityCollision,
        EventCode::NodeUnrecoverableError,
        EventCode::NodeNormalTermination,
        EventCode::NetworkNotFound,
        EventCode::NetworkClientTooOld,
        EventCode::NetworkRequestingConfig,
        EventCode::NetworkOk,
        EventCode::NetworkAccessDenied,
        EventCode::NetworkReadyIp4,
        EventCode::NetworkReadyIp6,
        EventCode::NetworkDown,
        EventCode::NetworkStackUp,
        EventCode::NetworkStackDown,
        EventCode::NetifUpIp4,
        EventCode::NetifUpIp6,
        EventCode::NetifDownIp4,
        EventCode::NetifDownIp6,
        EventCode::NetifRemoved,
        EventCode::NetifLinkUp,
        EventCode::NetifLinkDown,
        EventCode::NetifNewAddress,
        EventCode::PeerP2p,
        EventCode::PeerRelay,
        EventCode::PeerUnreachable,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    pub fn category(self) -> EventCategory {
        match self.code() {
            -1 => EventCategory::None,
            0..=31 => EventCategory::Node,
            32..=47 => EventCategory::Network,
            48..=63 => EventCategory::Stack,
            64..=95 => EventCategory::Netif,
            _ => EventCategory::Peer,
        }
    }
}

/// One lifecycle/status notification. `id` is a node id or a network id
/// depending on the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub code: EventCode,
    pub id: u64,
}

impl Event {
    pub fn node(code: EventCode, node: NodeId) -> Self {
        Self { code, id: node.0 }
    }

    pub fn network(code: EventCode, nwid: NetworkId) -> Self {
        Self { code, id: nwid.0 }
    }
}

// Socket-level constants. Values are part of the C ABI.

pub const AF_UNSPEC: i32 = 0x0000;
pub const AF_INET: i32 = 0x0002;
pub const AF_INET6: i32 = 0x000a;

pub const SOCK_STREAM: i32 = 0x0001;
pub const SOCK_DGRAM: i32 = 0x0002;
pub const SOCK_RAW: i32 = 0x0003;

pub const IPPROTO_IP: i32 = 0x0000;
pub const IPPROTO_ICMP: i32 = 0x0001;
pub const IPPROTO_TCP: i32 = 0x0006;
pub const IPPROTO_UDP: i32 = 0x0011;
pub const IPPROTO_IPV6: i32 = 0x0029;

pub const MSG_PEEK: i32 = 0x0001;
pub const MSG_WAITALL: i32 = 0x0002;
pub const MSG_OOB: i32 = 0x0004;
pub const MSG_DONTWAIT: i32 = 0x0008;
pub const MSG_MORE: i32 = 0x0010;

pub const F_GETFL: i32 = 0x0003;
pub const F_SETFL: i32 = 0x0004;
pub const O_NONBLOCK: i32 = 0x0001;

pub const SHUT_RD: i32 = 0x0000;
pub const SHUT_WR: i32 = 0x0001;
pub const SHUT_RDWR: i32 = 0x0002;

const IOCPARM_MASK: u64 = 0x7f;
const IOC_OUT: u64 = 0x4000_0000;
const IOC_IN: u64 = 0x8000_0000;

const fn ior(group: u8, num: u8, size: u64) -> u64 {
    IOC_OUT | ((size & IOCPARM_MASK) << 16) | ((group as u64) << 8) | num as u64
}

const fn iow(group: u8, num: u8, size: u64) -> u64 {
    IOC_IN | ((size & IOCPARM_MASK) << 16) | ((group as u64) << 8) | num as u64
}

/// Bytes available to read.
pub const FIONREAD: u64 = ior(b'f', 127, 8);
/// Set or clear non-blocking mode.
pub const FIONBIO: u64 = iow(b'f', 126, 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_codes_are_stable() {
        assert_eq!(EventCode::NodeUp.code(), 0);
        assert_eq!(EventCode::NodeUnrecoverableError.code(), 16);
        assert_eq!(EventCode::NetworkRequestingConfig.code(), 34);
        assert_eq!(EventCode::NetworkReadyIp4.code(), 37);
        assert_eq!(EventCode::NetworkStackUp.code(), 48);
        assert_eq!(EventCode::NetifNewAddress.code(), 71);
        assert_eq!(EventCode::PeerUnreachable.code(), 98);
        for c in EventCode::ALL {
            assert_eq!(EventCode::from_code(c.code()), Some(c));
        }
        assert_eq!(EventCode::from_code(5), None);
    }

    #[test]
    fn event_categories() {
        assert_eq!(EventCode::NodeDown.category(), EventCategory::Node);
        assert_eq!(EventCode::NetworkDown.category(), EventCategory::Network);
        assert_eq!(EventCode::NetworkStackDown.category(), EventCategory::Stack);
        assert_eq!(EventCode::NetifRemoved.category(), EventCategory::Netif);
        assert_eq!(EventCode::PeerRelay.category(), EventCategory::Peer);
    }

    #[test]
    fn ioctl_requests_match_header() {
        assert_eq!(FIONREAD, 0x4008_667f);
        assert_eq!(FIONBIO, 0x8008_667e);
    }

    #[test]
    fn network_id_parse_and_display() {
        let id: NetworkId = "8056c2e21c000001".parse().unwrap();
        assert_eq!(id.0, 0x8056_c2e2_1c00_0001);
        assert_eq!(id.to_string(), "8056c2e21c000001");
        assert!("".parse::<NetworkId>().is_err());
        assert!("xyz".parse::<NetworkId>().is_err());
        assert!("12345678901234567".parse::<NetworkId>().is_err());
    }

    #[test]
    fn node_id_bytes_and_reserved() {
        let id = NodeId(0xab_cdef_0123);
        assert_eq!(NodeId::from_bytes(&id.to_bytes()), id);
        assert_eq!(id.to_string(), "abcdef0123");
        assert!(NodeId(0).is_reserved());
        assert!(NodeId(0xff_0000_0001).is_reserved());
        assert!(!id.is_reserved());
    }

    #[test]
    fn subnet_membership() {
        let a = AddressRecord::new("10.147.17.5".parse().unwrap(), 24);
        assert!(a.contains(&"10.147.17.200".parse().unwrap()));
        assert!(!a.contains(&"10.147.18.1".parse().unwrap()));
        assert!(!a.contains(&"fd00::1".parse().unwrap()));
        let b = AddressRecord::new("fd80:56c2:e21c:0:99:93ab:cdef:123".parse().unwrap(), 88);
        assert!(b.contains(&"fd80:56c2:e21c:0:99:93ff:ffff:ffff".parse().unwrap()));
        assert!(!b.contains(&"fd80:56c2:e21c:0:99:94ab:cdef:123".parse().unwrap()));
    }
}
