//! In-process overlay core.
//!
//! A [`Fabric`] plays the part of the planet, the network controllers and the
//! physical links for every node opened on it. Nodes are registered by node
//! id; frames between nodes are sealed with the pairwise session key
//! (X25519 + ChaCha20-Poly1305) and dropped into the destination's inbox.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::address::{rfc4193_address, sixplane_address, RFC4193_PREFIX_LEN, SIXPLANE_PREFIX_LEN};
use crate::error::{Result, ZtsError};
use crate::identity::{Identity, PublicKey, SessionCipher};
use crate::model::{
    AddressRecord, NetworkConfig, NetworkId, NetworkStatus, NodeId, PeerRecord, PeerRole,
    PeerStatus, PhysicalPath, RouteRecord, MAX_PEER_NETWORK_PATHS,
};
use crate::overlay::{OverlayCore, OverlayEvent, OverlayProvider, Waker};

/// Node id the fabric reports for its root server.
pub const PLANET_NODE_ID: NodeId = NodeId(0x77_8cde_7190);

/// Version reported for fabric-hosted peers.
pub const FABRIC_VERSION: (u32, u32, u32) = (1, 0, 0);

pub const DEFAULT_MTU: u32 = 2800;

const PLANET_PORT: u16 = 9993;
const DIRECT_LATENCY_MS: u32 = 1;
const RELAY_LATENCY_MS: u32 = 40;

/// Physical reachability between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Direct,
    Relayed,
    Down,
}

impl LinkState {
    fn peer_status(self) -> PeerStatus {
        match self {
            LinkState::Direct => PeerStatus::Direct,
            LinkState::Relayed => PeerStatus::Relayed,
            LinkState::Down => PeerStatus::Unreachable,
        }
    }
}

/// Controller-side definition of a virtual network.
#[derive(Debug, Clone)]
pub struct NetworkTemplate {
    pub name: String,
    /// IPv4 assignment pool: network address and prefix length.
    pub ipv4_pool: Option<(Ipv4Addr, u8)>,
    pub rfc4193: bool,
    pub sixplane: bool,
    pub mtu: u32,
    /// Members must be authorized before they get a configuration.
    pub private: bool,
    pub routes: Vec<RouteRecord>,
}

impl NetworkTemplate {
    /// Public network handing out addresses from `net/prefix_len`.
    pub fn ipv4(name: &str, net: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            name: name.to_owned(),
            ipv4_pool: Some((net, prefix_len)),
            rfc4193: false,
            sixplane: false,
            mtu: DEFAULT_MTU,
            private: false,
            routes: Vec::new(),
        }
    }
}

enum Inbound {
    Event(OverlayEvent),
    Sealed {
        nwid: NetworkId,
        from: NodeId,
        nonce: u64,
        data: Vec<u8>,
    },
}

struct Contact {
    status: PeerStatus,
    last_send: u64,
    last_receive: u64,
}

struct Member {
    public: PublicKey,
    session: u64,
    port: u16,
    online: bool,
    waker: Waker,
    inbox: VecDeque<Inbound>,
    pending: Vec<NetworkId>,
    denied: HashSet<NetworkId>,
    joined: HashMap<NetworkId, Vec<AddressRecord>>,
    orbits: BTreeSet<u64>,
    contacts: BTreeMap<NodeId, Contact>,
}

impl Member {
    fn new(public: PublicKey, session: u64, port: u16, waker: Waker) -> Self {
        Self {
            public,
            session,
            port,
            online: false,
            waker,
            inbox: VecDeque::new(),
            pending: Vec::new(),
            denied: HashSet::new(),
            joined: HashMap::new(),
            orbits: BTreeSet::new(),
            contacts: BTreeMap::new(),
        }
    }

    fn push(&mut self, ev: OverlayEvent) {
        self.inbox.push_back(Inbound::Event(ev));
    }
}

struct NetworkDef {
    template: NetworkTemplate,
    authorized: HashSet<NodeId>,
    next_host: u32,
    leases: HashMap<NodeId, Ipv4Addr>,
    extra: HashMap<NodeId, Vec<AddressRecord>>,
}

impl NetworkDef {
    fn lease(&mut self, nwid: NetworkId, node: NodeId) -> Option<Ipv4Addr> {
        if let Some(ip) = self.leases.get(&node) {
            return Some(*ip);
        }
        let (net, prefix) = self.template.ipv4_pool?;
        let host_bits = 32 - u32::from(prefix.min(30));
        let hosts = (1u32 << host_bits) - 2;
        if self.next_host > hosts {
            warn!(network = %nwid, "ipv4 pool exhausted");
            return None;
        }
        let ip = Ipv4Addr::from(u32::from(net) + self.next_host);
        self.next_host += 1;
        self.leases.insert(node, ip);
        Some(ip)
    }

    fn config_for(&mut self, nwid: NetworkId, node: NodeId) -> NetworkConfig {
        let mut addresses = Vec::new();
        if let Some(ip) = self.lease(nwid, node) {
            let prefix = self.template.ipv4_pool.map_or(32, |(_, p)| p);
            addresses.push(AddressRecord::new(IpAddr::V4(ip), prefix));
        }
        if self.template.rfc4193 {
            addresses.push(AddressRecord::new(
                IpAddr::V6(rfc4193_address(nwid, node)),
                RFC4193_PREFIX_LEN,
            ));
        }
        if self.template.sixplane {
            addresses.push(AddressRecord::new(
                IpAddr::V6(sixplane_address(nwid, node)),
                SIXPLANE_PREFIX_LEN,
            ));
        }
        if let Some(extra) = self.extra.get(&node) {
            addresses.extend(extra.iter().copied());
        }
        NetworkConfig {
            name: self.template.name.clone(),
            mtu: self.template.mtu,
            addresses,
            routes: self.template.routes.clone(),
        }
    }
}

#[derive(Default)]
struct FabricInner {
    members: HashMap<NodeId, Member>,
    networks: HashMap<NetworkId, NetworkDef>,
    moons: HashMap<u64, u64>,
    links: HashMap<(NodeId, NodeId), LinkState>,
    sessions: u64,
}

impl FabricInner {
    fn link(&self, a: NodeId, b: NodeId) -> LinkState {
        self.links
            .get(&link_key(a, b))
            .copied()
            .unwrap_or(LinkState::Direct)
    }

    /// Record traffic between `me` and `peer`; announce status changes.
    fn touch(&mut self, me: NodeId, peer: NodeId, status: PeerStatus, sent: bool) {
        let now = now_ms();
        let Some(m) = self.members.get_mut(&me) else {
            return;
        };
        let announce = match m.contacts.get_mut(&peer) {
            Some(c) => {
                let changed = c.status != status;
                c.status = status;
                if sent {
                    c.last_send = now;
                } else {
                    c.last_receive = now;
                }
                changed
            }
            None => {
                m.contacts.insert(
                    peer,
                    Contact {
                        status,
                        last_send: if sent { now } else { 0 },
                        last_receive: if sent { 0 } else { now },
                    },
                );
                true
            }
        };
        if announce {
            m.push(OverlayEvent::Peer { node: peer, status });
        }
    }

    fn owner_of(&self, nwid: NetworkId, dst: &IpAddr) -> Option<NodeId> {
        self.members
            .iter()
            .find(|(_, m)| {
                m.joined
                    .get(&nwid)
                    .is_some_and(|addrs| addrs.iter().any(|a| a.ip == *dst))
            })
            .map(|(id, _)| *id)
    }

    /// Push a fresh configuration to `node` if it is a member of `nwid`.
    fn refresh_config(&mut self, nwid: NetworkId, node: NodeId) -> Option<Waker> {
        let FabricInner {
            members, networks, ..
        } = self;
        let m = members.get_mut(&node)?;
        if !m.joined.contains_key(&nwid) {
            return None;
        }
        let config = networks.get_mut(&nwid)?.config_for(nwid, node);
        m.joined.insert(nwid, config.addresses.clone());
        m.push(OverlayEvent::NetworkConfig { nwid, config });
        Some(m.waker.clone())
    }
}

fn link_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn wake_all(wakers: Vec<Waker>) {
    for w in wakers {
        w();
    }
}

/// Shared handle to one in-process overlay. Cloning shares the same fabric.
#[derive(Clone, Default)]
pub struct Fabric {
    inner: Arc<Mutex<FabricInner>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define (or redefine) a network on the controller.
    pub fn define_network(&self, nwid: NetworkId, template: NetworkTemplate) {
        info!(network = %nwid, name = %template.name, private = template.private, "network defined");
        let mut inner = self.inner.lock();
        match inner.networks.get_mut(&nwid) {
            Some(def) => def.template = template,
            None => {
                inner.networks.insert(
                    nwid,
                    NetworkDef {
                        template,
                        authorized: HashSet::new(),
                        next_host: 1,
                        leases: HashMap::new(),
                        extra: HashMap::new(),
                    },
                );
            }
        }
    }

    /// Authorize `node` on a private network. A member waiting after an
    /// access-denied answer is configured on its next poll.
    pub fn authorize(&self, nwid: NetworkId, node: NodeId) -> Result<()> {
        let waker = {
            let mut inner = self.inner.lock();
            let def = inner
                .networks
                .get_mut(&nwid)
                .ok_or(ZtsError::InvalidArgument("unknown network"))?;
            def.authorized.insert(node);
            inner.members.get_mut(&node).and_then(|m| {
                m.denied.remove(&nwid).then(|| {
                    m.pending.push(nwid);
                    m.waker.clone()
                })
            })
        };
        debug!(network = %nwid, %node, "member authorized");
        if let Some(w) = waker {
            w();
        }
        Ok(())
    }

    /// Withdraw authorization: the member loses its addresses and is told
    /// access is denied.
    pub fn revoke(&self, nwid: NetworkId, node: NodeId) -> Result<()> {
        let waker = {
            let mut inner = self.inner.lock();
            let def = inner
                .networks
                .get_mut(&nwid)
                .ok_or(ZtsError::InvalidArgument("unknown network"))?;
            def.authorized.remove(&node);
            let (name, mtu) = (def.template.name.clone(), def.template.mtu);
            inner.members.get_mut(&node).and_then(|m| {
                m.joined.remove(&nwid)?;
                m.denied.insert(nwid);
                m.push(OverlayEvent::NetworkConfig {
                    nwid,
                    config: NetworkConfig {
                        name,
                        mtu,
                        addresses: Vec::new(),
                        routes: Vec::new(),
                    },
                });
                m.push(OverlayEvent::NetworkStatus {
                    nwid,
                    status: NetworkStatus::AccessDenied,
                });
                Some(m.waker.clone())
            })
        };
        if let Some(w) = waker {
            w();
        }
        Ok(())
    }

    /// Assign an additional static address to `node`; pushed immediately if
    /// the node is a member.
    pub fn assign_address(&self, nwid: NetworkId, node: NodeId, addr: AddressRecord) -> Result<()> {
        let waker = {
            let mut inner = self.inner.lock();
            inner
                .networks
                .get_mut(&nwid)
                .ok_or(ZtsError::InvalidArgument("unknown network"))?
                .extra
                .entry(node)
                .or_default()
                .push(addr);
            inner.refresh_config(nwid, node)
        };
        if let Some(w) = waker {
            w();
        }
        Ok(())
    }

    /// Register a moon that nodes can orbit with the matching seed.
    pub fn define_moon(&self, world: u64, seed: u64) {
        self.inner.lock().moons.insert(world, seed);
    }

    pub fn set_link(&self, a: NodeId, b: NodeId, state: LinkState) {
        let mut wakers = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.links.insert(link_key(a, b), state);
            let status = state.peer_status();
            for (me, peer) in [(a, b), (b, a)] {
                if let Some(m) = inner.members.get_mut(&me) {
                    if let Some(c) = m.contacts.get_mut(&peer) {
                        if c.status != status {
                            c.status = status;
                            m.push(OverlayEvent::Peer { node: peer, status });
                            wakers.push(m.waker.clone());
                        }
                    }
                }
            }
        }
        debug!(%a, %b, ?state, "link state changed");
        wake_all(wakers);
    }

    /// Node ids currently registered.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.inner.lock().members.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl OverlayProvider for Fabric {
    fn open(&self, identity: Identity, port: u16, waker: Waker) -> Result<Box<dyn OverlayCore>> {
        let id = identity.node_id();
        let public = *identity.public_key();
        let mut inner = self.inner.lock();
        inner.sessions += 1;
        let session = inner.sessions;
        let collided = match inner.members.get(&id) {
            Some(m) if m.public != public => true,
            _ => {
                inner
                    .members
                    .insert(id, Member::new(public, session, port, waker));
                false
            }
        };
        if collided {
            warn!(node = %id, "node id already claimed by a different key");
        } else {
            debug!(node = %id, port, "node registered");
        }
        Ok(Box::new(FabricNode {
            fabric: self.clone(),
            identity,
            id,
            session,
            collided,
            local: VecDeque::new(),
            ciphers: HashMap::new(),
            tx_count: 0,
            rx_last: HashMap::new(),
            shut: false,
        }))
    }
}

/// One node on a [`Fabric`].
pub struct FabricNode {
    fabric: Fabric,
    identity: Identity,
    id: NodeId,
    session: u64,
    collided: bool,
    /// Events that cannot go through the shared inbox.
    local: VecDeque<OverlayEvent>,
    ciphers: HashMap<NodeId, SessionCipher>,
    tx_count: u32,
    rx_last: HashMap<NodeId, u64>,
    shut: bool,
}

impl FabricNode {
    fn check_usable(&self) -> Result<()> {
        if self.shut || self.collided {
            return Err(ZtsError::ServiceUnavailable);
        }
        Ok(())
    }

    fn cipher(&mut self, peer: NodeId, public: &PublicKey) -> &SessionCipher {
        let identity = &self.identity;
        self.ciphers
            .entry(peer)
            .or_insert_with(|| SessionCipher::new(identity, public))
    }

    /// Session number in the high half, per-session counter in the low half:
    /// nonces never repeat for one key, even across re-opens.
    fn next_nonce(&mut self) -> u64 {
        self.tx_count = self.tx_count.wrapping_add(1);
        (self.session << 32) | u64::from(self.tx_count)
    }

    fn open_sealed(
        &mut self,
        nwid: NetworkId,
        from: NodeId,
        public: Option<PublicKey>,
        nonce: u64,
        data: &[u8],
    ) -> Option<Vec<u8>> {
        if self.rx_last.get(&from).is_some_and(|last| nonce <= *last) {
            trace!(peer = %from, nonce, "dropping replayed frame");
            return None;
        }
        if !self.ciphers.contains_key(&from) {
            self.cipher(from, &public?);
        }
        match self.ciphers.get(&from)?.open(nwid, nonce, data) {
            Ok(plain) => {
                self.rx_last.insert(from, nonce);
                Some(plain)
            }
            Err(e) => {
                warn!(peer = %from, error = %e, "dropping frame that failed authentication");
                None
            }
        }
    }

    fn peer_record(&self, inner: &FabricInner, peer: NodeId, contact: &Contact) -> PeerRecord {
        let link = inner.link(self.id, peer);
        let registered = inner.members.get(&peer);
        let paths = match (link, registered) {
            (LinkState::Direct, Some(m)) => vec![PhysicalPath {
                address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), m.port),
                last_send: contact.last_send,
                last_receive: contact.last_receive,
                trusted_path_id: 0,
                expired: false,
                preferred: true,
            }],
            _ => Vec::new(),
        };
        PeerRecord {
            node_id: peer,
            role: PeerRole::Leaf,
            version: registered.map(|_| FABRIC_VERSION),
            latency_ms: match link {
                LinkState::Direct => Some(DIRECT_LATENCY_MS),
                LinkState::Relayed => Some(RELAY_LATENCY_MS),
                LinkState::Down => None,
            },
            paths: paths.into_iter().take(MAX_PEER_NETWORK_PATHS).collect(),
        }
    }
}

fn root_record(node: NodeId, role: PeerRole) -> PeerRecord {
    PeerRecord {
        node_id: node,
        role,
        version: Some(FABRIC_VERSION),
        latency_ms: Some(DIRECT_LATENCY_MS),
        paths: vec![PhysicalPath {
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), PLANET_PORT),
            last_send: 0,
            last_receive: 0,
            trusted_path_id: 0,
            expired: false,
            preferred: true,
        }],
    }
}

fn moon_node(world: u64) -> NodeId {
    NodeId(world & NodeId::MASK)
}

impl OverlayCore for FabricNode {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn go_online(&mut self) -> Result<()> {
        if self.shut {
            return Err(ZtsError::ServiceUnavailable);
        }
        if self.collided {
            self.local.push_back(OverlayEvent::IdentityCollision);
            return Ok(());
        }
        let mut inner = self.fabric.inner.lock();
        let m = inner
            .members
            .get_mut(&self.id)
            .filter(|m| m.session == self.session)
            .ok_or(ZtsError::ServiceUnavailable)?;
        if !m.online {
            m.online = true;
            m.push(OverlayEvent::NodeOnline);
            info!(node = %self.id, "node online");
        }
        Ok(())
    }

    fn go_offline(&mut self) {
        let mut inner = self.fabric.inner.lock();
        if let Some(m) = inner
            .members
            .get_mut(&self.id)
            .filter(|m| m.session == self.session)
        {
            if m.online {
                m.online = false;
                m.push(OverlayEvent::NodeOffline);
                info!(node = %self.id, "node offline");
            }
        }
    }

    fn join(&mut self, nwid: NetworkId) -> Result<()> {
        self.check_usable()?;
        let mut inner = self.fabric.inner.lock();
        let m = inner
            .members
            .get_mut(&self.id)
            .ok_or(ZtsError::ServiceUnavailable)?;
        if !m.pending.contains(&nwid) {
            m.pending.push(nwid);
        }
        m.denied.remove(&nwid);
        m.push(OverlayEvent::NetworkStatus {
            nwid,
            status: NetworkStatus::RequestingConfiguration,
        });
        let waker = m.waker.clone();
        drop(inner);
        waker();
        Ok(())
    }

    fn leave(&mut self, nwid: NetworkId) -> Result<()> {
        self.check_usable()?;
        let mut inner = self.fabric.inner.lock();
        if let Some(m) = inner.members.get_mut(&self.id) {
            m.pending.retain(|n| *n != nwid);
            m.denied.remove(&nwid);
            m.joined.remove(&nwid);
        }
        Ok(())
    }

    fn orbit(&mut self, world: u64, seed: u64) -> Result<()> {
        self.check_usable()?;
        let mut inner = self.fabric.inner.lock();
        match inner.moons.get(&world) {
            None => return Err(ZtsError::InvalidArgument("unknown moon")),
            Some(s) if *s != seed => return Err(ZtsError::InvalidArgument("moon seed mismatch")),
            Some(_) => {}
        }
        if let Some(m) = inner.members.get_mut(&self.id) {
            m.orbits.insert(world);
        }
        info!(node = %self.id, world = format_args!("{world:016x}"), "orbiting moon");
        Ok(())
    }

    fn deorbit(&mut self, world: u64) -> Result<()> {
        self.check_usable()?;
        let mut inner = self.fabric.inner.lock();
        let removed = inner
            .members
            .get_mut(&self.id)
            .is_some_and(|m| m.orbits.remove(&world));
        if !removed {
            return Err(ZtsError::InvalidArgument("moon not orbited"));
        }
        Ok(())
    }

    fn peers(&self) -> Vec<PeerRecord> {
        let inner = self.fabric.inner.lock();
        let Some(m) = inner.members.get(&self.id).filter(|_| !self.collided) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        if m.online {
            out.push(root_record(PLANET_NODE_ID, PeerRole::Planet));
        }
        out.extend(m.orbits.iter().map(|w| root_record(moon_node(*w), PeerRole::Moon)));
        out.extend(
            m.contacts
                .iter()
                .map(|(peer, c)| self.peer_record(&inner, *peer, c)),
        );
        out
    }

    fn peer_status(&self, node: NodeId) -> Result<PeerStatus> {
        let inner = self.fabric.inner.lock();
        if node == PLANET_NODE_ID {
            return Ok(PeerStatus::Direct);
        }
        if let Some(m) = inner.members.get(&self.id) {
            if m.orbits.iter().any(|w| moon_node(*w) == node) {
                return Ok(PeerStatus::Direct);
            }
        }
        if inner.members.contains_key(&node) {
            return Ok(inner.link(self.id, node).peer_status());
        }
        Err(ZtsError::InvalidArgument("unknown peer"))
    }

    fn send_frame(&mut self, nwid: NetworkId, dst: IpAddr, frame: Vec<u8>) -> Result<()> {
        self.check_usable()?;
        let nonce = self.next_nonce();
        let fabric = self.fabric.clone();
        let mut inner = fabric.inner.lock();
        let owner = inner
            .owner_of(nwid, &dst)
            .filter(|o| *o != self.id && inner.members.get(o).is_some_and(|m| m.online));
        let Some(owner) = owner else {
            if let Some(m) = inner.members.get_mut(&self.id) {
                m.push(OverlayEvent::Unreachable { nwid, dst });
            }
            return Ok(());
        };
        let link = inner.link(self.id, owner);
        inner.touch(self.id, owner, link.peer_status(), true);
        inner.touch(owner, self.id, link.peer_status(), false);
        if link == LinkState::Down {
            trace!(from = %self.id, to = %owner, "link down, dropping frame");
            return Ok(());
        }
        let Some(public) = inner.members.get(&owner).map(|m| m.public) else {
            return Ok(());
        };
        let sealed = match self.cipher(owner, &public).seal(nwid, nonce, &frame) {
            Ok(s) => s,
            Err(e) => {
                warn!(to = %owner, error = %e, "frame encryption failed");
                return Ok(());
            }
        };
        let waker = inner.members.get_mut(&owner).map(|m| {
            m.inbox.push_back(Inbound::Sealed {
                nwid,
                from: self.id,
                nonce,
                data: sealed,
            });
            m.waker.clone()
        });
        drop(inner);
        if let Some(w) = waker {
            w();
        }
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<OverlayEvent> {
        let mut out: Vec<OverlayEvent> = self.local.drain(..).collect();
        if self.shut || self.collided {
            return out;
        }
        let mut sealed = Vec::new();
        let publics: Vec<Option<PublicKey>>;
        {
            let mut inner = self.fabric.inner.lock();
            let FabricInner {
                members, networks, ..
            } = &mut *inner;
            let Some(m) = members
                .get_mut(&self.id)
                .filter(|m| m.session == self.session)
            else {
                return out;
            };
            for item in m.inbox.drain(..) {
                match item {
                    Inbound::Event(ev) => out.push(ev),
                    Inbound::Sealed {
                        nwid,
                        from,
                        nonce,
                        data,
                    } => {
                        out.push(OverlayEvent::Frame {
                            nwid,
                            data: Vec::new(),
                        });
                        sealed.push((out.len() - 1, nwid, from, nonce, data));
                    }
                }
            }
            for nwid in std::mem::take(&mut m.pending) {
                let Some(def) = networks.get_mut(&nwid) else {
                    debug!(network = %nwid, "network not found");
                    out.push(OverlayEvent::NetworkStatus {
                        nwid,
                        status: NetworkStatus::NotFound,
                    });
                    continue;
                };
                if def.template.private && !def.authorized.contains(&self.id) {
                    debug!(network = %nwid, node = %self.id, "access denied");
                    m.denied.insert(nwid);
                    out.push(OverlayEvent::NetworkStatus {
                        nwid,
                        status: NetworkStatus::AccessDenied,
                    });
                    continue;
                }
                let config = def.config_for(nwid, self.id);
                m.joined.insert(nwid, config.addresses.clone());
                out.push(OverlayEvent::NetworkStatus {
                    nwid,
                    status: NetworkStatus::Ok,
                });
                out.push(OverlayEvent::NetworkConfig { nwid, config });
            }
            publics = sealed
                .iter()
                .map(|(_, _, from, _, _)| members.get(from).map(|p| p.public))
                .collect();
        }
        let mut dropped = Vec::new();
        for ((idx, nwid, from, nonce, data), public) in sealed.into_iter().zip(publics) {
            match self.open_sealed(nwid, from, public, nonce, &data) {
                Some(plain) => out[idx] = OverlayEvent::Frame { nwid, data: plain },
                None => dropped.push(idx),
            }
        }
        for idx in dropped.into_iter().rev() {
            out.remove(idx);
        }
        out
    }

    fn shutdown(&mut self) {
        if self.shut {
            return;
        }
        self.shut = true;
        let mut inner = self.fabric.inner.lock();
        if inner
            .members
            .get(&self.id)
            .is_some_and(|m| m.session == self.session)
        {
            inner.members.remove(&self.id);
            debug!(node = %self.id, "node unregistered");
        }
    }
}

impl Drop for FabricNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NWID: NetworkId = NetworkId(0x8056_c2e2_1c00_0001);

    fn noop() -> Waker {
        Arc::new(|| {})
    }

    fn online(fabric: &Fabric) -> Box<dyn OverlayCore> {
        let mut n = fabric.open(Identity::generate(), 9994, noop()).unwrap();
        n.go_online().unwrap();
        assert_eq!(n.poll_events(), vec![OverlayEvent::NodeOnline]);
        n
    }

    fn joined(fabric: &Fabric) -> (Box<dyn OverlayCore>, IpAddr) {
        let mut n = online(fabric);
        n.join(NWID).unwrap();
        let evs = n.poll_events();
        let ip = evs
            .iter()
            .find_map(|e| match e {
                OverlayEvent::NetworkConfig { config, .. } => Some(config.addresses[0].ip),
                _ => None,
            })
            .unwrap();
        (n, ip)
    }

    #[test]
    fn join_unknown_then_known_network() {
        let fabric = Fabric::new();
        let mut n = online(&fabric);
        n.join(NWID).unwrap();
        assert_eq!(
            n.poll_events(),
            vec![
                OverlayEvent::NetworkStatus {
                    nwid: NWID,
                    status: NetworkStatus::RequestingConfiguration
                },
                OverlayEvent::NetworkStatus {
                    nwid: NWID,
                    status: NetworkStatus::NotFound
                },
            ]
        );
        let mut t = NetworkTemplate::ipv4("lab", "10.147.17.0".parse().unwrap(), 24);
        t.rfc4193 = true;
        fabric.define_network(NWID, t);
        n.join(NWID).unwrap();
        let evs = n.poll_events();
        assert_eq!(evs.len(), 3);
        let OverlayEvent::NetworkConfig { config, .. } = &evs[2] else {
            panic!("expected config, got {evs:?}");
        };
        assert_eq!(config.name, "lab");
        assert_eq!(config.addresses[0], AddressRecord::new("10.147.17.1".parse().unwrap(), 24));
        assert_eq!(
            config.addresses[1].ip,
            IpAddr::V6(rfc4193_address(NWID, n.node_id()))
        );
    }

    #[test]
    fn private_network_needs_authorization() {
        let fabric = Fabric::new();
        let mut t = NetworkTemplate::ipv4("private", "10.1.0.0".parse().unwrap(), 16);
        t.private = true;
        fabric.define_network(NWID, t);
        let mut n = online(&fabric);
        n.join(NWID).unwrap();
        assert!(n.poll_events().contains(&OverlayEvent::NetworkStatus {
            nwid: NWID,
            status: NetworkStatus::AccessDenied
        }));
        fabric.authorize(NWID, n.node_id()).unwrap();
        let evs = n.poll_events();
        assert_eq!(
            evs[0],
            OverlayEvent::NetworkStatus {
                nwid: NWID,
                status: NetworkStatus::Ok
            }
        );
        fabric.revoke(NWID, n.node_id()).unwrap();
        let evs = n.poll_events();
        assert!(matches!(&evs[0], OverlayEvent::NetworkConfig { config, .. } if config.addresses.is_empty()));
    }

    #[test]
    fn frames_are_delivered_sealed_and_wake_the_receiver() {
        let fabric = Fabric::new();
        fabric.define_network(NWID, NetworkTemplate::ipv4("lab", "10.0.0.0".parse().unwrap(), 24));
        let (mut a, _) = joined(&fabric);
        let wakes = Arc::new(AtomicUsize::new(0));
        let counter = wakes.clone();
        let mut b = fabric
            .open(
                Identity::generate(),
                9995,
                Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        b.go_online().unwrap();
        b.join(NWID).unwrap();
        let b_ip = b
            .poll_events()
            .into_iter()
            .find_map(|e| match e {
                OverlayEvent::NetworkConfig { config, .. } => Some(config.addresses[0].ip),
                _ => None,
            })
            .unwrap();
        let before = wakes.load(Ordering::SeqCst);
        a.send_frame(NWID, b_ip, b"segment".to_vec()).unwrap();
        assert!(wakes.load(Ordering::SeqCst) > before);
        let evs = b.poll_events();
        assert!(evs.contains(&OverlayEvent::Peer {
            node: a.node_id(),
            status: PeerStatus::Direct
        }));
        assert!(evs.contains(&OverlayEvent::Frame {
            nwid: NWID,
            data: b"segment".to_vec()
        }));
        assert!(a.poll_events().contains(&OverlayEvent::Peer {
            node: b.node_id(),
            status: PeerStatus::Direct
        }));
        assert_eq!(a.peers().len(), 2);
    }

    #[test]
    fn unknown_destination_is_unreachable() {
        let fabric = Fabric::new();
        fabric.define_network(NWID, NetworkTemplate::ipv4("lab", "10.0.0.0".parse().unwrap(), 24));
        let (mut a, _) = joined(&fabric);
        let dst: IpAddr = "10.0.0.200".parse().unwrap();
        a.send_frame(NWID, dst, vec![1, 2, 3]).unwrap();
        assert_eq!(a.poll_events(), vec![OverlayEvent::Unreachable { nwid: NWID, dst }]);
    }

    #[test]
    fn link_down_drops_frames_and_reports_peer() {
        let fabric = Fabric::new();
        fabric.define_network(NWID, NetworkTemplate::ipv4("lab", "10.0.0.0".parse().unwrap(), 24));
        let (mut a, _) = joined(&fabric);
        let (mut b, b_ip) = joined(&fabric);
        a.send_frame(NWID, b_ip, vec![0]).unwrap();
        a.poll_events();
        b.poll_events();
        fabric.set_link(a.node_id(), b.node_id(), LinkState::Relayed);
        assert_eq!(a.peer_status(b.node_id()).unwrap(), PeerStatus::Relayed);
        fabric.set_link(a.node_id(), b.node_id(), LinkState::Down);
        assert_eq!(a.peer_status(b.node_id()).unwrap(), PeerStatus::Unreachable);
        assert!(a.poll_events().contains(&OverlayEvent::Peer {
            node: b.node_id(),
            status: PeerStatus::Unreachable
        }));
        b.poll_events();
        a.send_frame(NWID, b_ip, vec![1]).unwrap();
        assert!(b.poll_events().is_empty());
        assert!(a.peer_status(NodeId(0x11_1111_1111)).is_err());
    }

    #[test]
    fn moons_orbit_and_deorbit() {
        let fabric = Fabric::new();
        fabric.define_moon(0xdead_beef_00, 0x1234);
        let mut n = online(&fabric);
        assert!(n.orbit(0xdead_beef_01, 0x1234).is_err());
        assert!(n.orbit(0xdead_beef_00, 0x9999).is_err());
        n.orbit(0xdead_beef_00, 0x1234).unwrap();
        assert!(n.peers().iter().any(|p| p.role == PeerRole::Moon));
        n.deorbit(0xdead_beef_00).unwrap();
        assert_eq!(
            n.deorbit(0xdead_beef_00),
            Err(ZtsError::InvalidArgument("moon not orbited"))
        );
    }

    #[test]
    fn conflicting_key_reports_identity_collision() {
        let fabric = Fabric::new();
        let id = Identity::generate();
        let other = Identity::generate();
        fabric.inner.lock().members.insert(
            id.node_id(),
            Member::new(*other.public_key(), 0, 1, noop()),
        );
        let mut n = fabric.open(id, 9994, noop()).unwrap();
        n.go_online().unwrap();
        assert_eq!(n.poll_events(), vec![OverlayEvent::IdentityCollision]);
        assert_eq!(n.join(NWID), Err(ZtsError::ServiceUnavailable));
    }

    #[test]
    fn shutdown_unregisters() {
        let fabric = Fabric::new();
        let mut n = online(&fabric);
        assert_eq!(fabric.nodes(), vec![n.node_id()]);
        n.shutdown();
        assert!(fabric.nodes().is_empty());
    }
}
