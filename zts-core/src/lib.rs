//! Virtual sockets over a peer-to-peer overlay network.
//! One [`Service`] per node: lifecycle, network membership, and a POSIX-style
//! socket API backed by an in-process TCP/IP stack.

pub mod address;
pub mod config;
pub mod error;
pub mod events;
pub mod fabric;
pub mod identity;
pub mod model;
pub mod network;
pub mod options;
pub mod overlay;
pub mod protocol;
pub mod service;
pub mod socket;
pub mod stack;
pub mod vstack;
pub mod wire;

// C ABI (zts_*) for static linking.
pub mod ffi;

pub use address::{rfc4193_address, sixplane_address};
pub use config::ServiceConfig;
pub use error::{Result, ZtsError};
pub use events::EventCallback;
pub use fabric::{Fabric, LinkState, NetworkTemplate};
pub use identity::Identity;
pub use model::{
    AddressFamily, AddressRecord, Event, EventCode, NetworkId, NetworkRecord, NetworkStatus, NodeId,
    PeerRecord, PeerStatus, RouteRecord,
};
pub use options::OptionValue;
pub use overlay::{OverlayCore, OverlayProvider};
pub use service::{Service, ServiceState};
pub use socket::{FdSet, Handle, SocketState};
