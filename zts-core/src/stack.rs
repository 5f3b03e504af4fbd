//! Seam to the embedded TCP/IP stack.
//!
//! Every method takes `&self`; implementations guard their state with one
//! internal lock that is never held while calling out. Connections are named
//! by [`ConnId`], which is never reused within one stack.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::error::{Result, ZtsError};
use crate::model::{AddressFamily, AddressRecord, NetworkId, RouteRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Stream,
    Datagram,
}

/// Stack-side view of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Listening,
    Connecting,
    Established,
    /// Refused, reset, timed out or unreachable; see `take_error`.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEvent {
    /// Readiness or state of the connection may have changed.
    Changed(ConnId),
    /// Teardown finished; the id is dead.
    Released(ConnId),
}

/// Output of one stack poll.
#[derive(Debug, Default)]
pub struct StackPoll {
    /// (network, destination virtual IP, encoded frame)
    pub outbound: Vec<(NetworkId, IpAddr, Vec<u8>)>,
    pub events: Vec<StackEvent>,
}

pub trait NetStack: Send + Sync {
    fn create(&self, kind: ConnKind, family: AddressFamily) -> Result<ConnId>;

    /// Returns the bound address (ephemeral port resolved).
    fn bind(&self, id: ConnId, addr: SocketAddr) -> Result<SocketAddr>;

    fn listen(&self, id: ConnId, backlog: usize) -> Result<()>;

    /// Stream: start the handshake. Datagram: set the default peer.
    fn connect(&self, id: ConnId, addr: SocketAddr, timeout: Duration) -> Result<()>;

    /// Dequeue the oldest pending connection, `None` when the backlog is empty.
    fn accept(&self, id: ConnId) -> Result<Option<(ConnId, SocketAddr)>>;

    /// Queue bytes; `WouldBlock` when no buffer space is free.
    fn send(&self, id: ConnId, data: &[u8], dst: Option<SocketAddr>) -> Result<usize>;

    /// Read bytes; `Ok(0)` at end of stream, `WouldBlock` when nothing is queued.
    fn recv(&self, id: ConnId, buf: &mut [u8], peek: bool) -> Result<(usize, Option<SocketAddr>)>;

    fn shutdown(&self, id: ConnId, read: bool, write: bool) -> Result<()>;

    /// Begin teardown. `Released` follows once the connection is gone.
    fn close(&self, id: ConnId, abortive: bool);

    fn state(&self, id: ConnId) -> ConnState;

    fn readiness(&self, id: ConnId) -> Readiness;

    /// Take and clear the pending error.
    fn take_error(&self, id: ConnId) -> Option<ZtsError>;

    fn bytes_readable(&self, id: ConnId) -> usize;

    fn local_addr(&self, id: ConnId) -> Option<SocketAddr>;

    fn peer_addr(&self, id: ConnId) -> Option<SocketAddr>;

    fn set_reuseaddr(&self, id: ConnId, on: bool);

    fn set_recv_buffer(&self, id: ConnId, bytes: usize) -> Result<()>;

    fn recv_buffer(&self, id: ConnId) -> usize;

    fn add_address(&self, nwid: NetworkId, addr: AddressRecord, mtu: u32);

    fn remove_address(&self, nwid: NetworkId, ip: IpAddr);

    /// Take every interface address of `nwid` down.
    fn remove_network(&self, nwid: NetworkId);

    fn set_routes(&self, nwid: NetworkId, routes: &[RouteRecord]);

    fn is_local(&self, ip: &IpAddr) -> bool;

    fn ingest(&self, nwid: NetworkId, frame: &[u8]);

    /// The overlay found no owner for `dst`.
    fn unreachable(&self, nwid: NetworkId, dst: IpAddr);

    /// Run timers, flush queued output and collect events.
    fn poll(&self, now: Instant) -> StackPoll;

    fn add_dns_nameserver(&self, addr: IpAddr) -> Result<()>;

    fn del_dns_nameserver(&self, addr: IpAddr) -> Result<()>;

    fn dns_nameservers(&self) -> Vec<IpAddr>;

    fn hostname(&self) -> String;

    fn set_hostname(&self, name: &str) -> Result<()>;
}
