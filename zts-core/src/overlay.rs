//! Seam to the overlay-networking core: identity-keyed node, membership
//! requests, encrypted frame transport, peer snapshots.

use std::net::IpAddr;
use std::sync::Arc;

use crate::error::Result;
use crate::identity::Identity;
use crate::model::{NetworkConfig, NetworkId, NetworkStatus, NodeId, PeerRecord, PeerStatus};

/// Wakes the service driver early. Cheap, callable from any thread.
pub type Waker = Arc<dyn Fn() + Send + Sync>;

/// Asynchronous signals from the overlay core, drained by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    NodeOnline,
    NodeOffline,
    /// Another node claims our id with a different key.
    IdentityCollision,
    Fatal(String),
    NetworkStatus {
        nwid: NetworkId,
        status: NetworkStatus,
    },
    NetworkConfig {
        nwid: NetworkId,
        config: NetworkConfig,
    },
    /// Decrypted stack frame for this node.
    Frame { nwid: NetworkId, data: Vec<u8> },
    /// No member of `nwid` owns `dst`.
    Unreachable { nwid: NetworkId, dst: IpAddr },
    Peer { node: NodeId, status: PeerStatus },
}

/// One overlay node. The service holds it behind a mutex; the driver polls it.
pub trait OverlayCore: Send {
    fn node_id(&self) -> NodeId;

    fn go_online(&mut self) -> Result<()>;

    fn go_offline(&mut self);

    /// Request membership. Status and configuration arrive as events.
    fn join(&mut self, nwid: NetworkId) -> Result<()>;

    fn leave(&mut self, nwid: NetworkId) -> Result<()>;

    fn orbit(&mut self, world: u64, seed: u64) -> Result<()>;

    fn deorbit(&mut self, world: u64) -> Result<()>;

    fn peers(&self) -> Vec<PeerRecord>;

    fn peer_status(&self, node: NodeId) -> Result<PeerStatus>;

    fn send_frame(&mut self, nwid: NetworkId, dst: IpAddr, frame: Vec<u8>) -> Result<()>;

    fn poll_events(&mut self) -> Vec<OverlayEvent>;

    /// Leave the overlay for good.
    fn shutdown(&mut self);
}

/// Creates overlay nodes for services.
pub trait OverlayProvider: Send + Sync {
    fn open(&self, identity: Identity, port: u16, waker: Waker) -> Result<Box<dyn OverlayCore>>;
}
