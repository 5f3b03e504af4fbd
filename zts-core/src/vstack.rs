//! In-process embedded stack.
//!
//! Streams use a three-segment open (Syn, SynAck) and receive-window flow
//! control: the opener and the acceptor advertise their receive capacity, a
//! sender never has more than that many unacknowledged bytes outstanding, and
//! the receiver returns credit with `Window` segments as the application
//! reads. Output is queued and flushed by `poll`, which the service driver
//! calls every tick.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::ServiceConfig;
use crate::error::{Result, ZtsError};
use crate::model::{AddressFamily, AddressRecord, NetworkId, RouteRecord};
use crate::protocol::{Packet, Segment};
use crate::stack::{
    ConnId, ConnKind, ConnState, NetStack, Readiness, StackEvent, StackPoll,
};
use crate::wire::{decode_exact, encode_frame};

pub const EPHEMERAL_PORT_MIN: u16 = 49152;
pub const EPHEMERAL_PORT_MAX: u16 = 65535;

/// Queued datagrams per socket; later arrivals are dropped.
pub const MAX_QUEUED_DATAGRAMS: usize = 64;

pub const MAX_DNS_NAMESERVERS: usize = 2;

pub const MAX_HOSTNAME_LEN: usize = 255;

const MAX_DATAGRAM_LEN: usize = 65507;

/// IP + transport header allowance subtracted from the MTU.
const HEADER_OVERHEAD: u32 = 40;

const MIN_SEGMENT: usize = 64;

/// How long a gracefully closed stream may take to drain before it is reset.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct StackConfig {
    pub send_buffer: usize,
    pub recv_buffer: usize,
}

impl From<&ServiceConfig> for StackConfig {
    fn from(c: &ServiceConfig) -> Self {
        Self {
            send_buffer: c.send_buffer,
            recv_buffer: c.recv_buffer,
        }
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self::from(&ServiceConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Listening,
    SynSent,
    Established,
    Failed,
}

struct Conn {
    kind: ConnKind,
    family: AddressFamily,
    phase: Phase,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    /// Listener holding this connection in its backlog, until accepted.
    parent: Option<ConnId>,
    /// Created by a listener; shares the listener's port.
    child: bool,
    reuseaddr: bool,
    rx: VecDeque<u8>,
    rx_cap: usize,
    tx: VecDeque<u8>,
    tx_cap: usize,
    /// Bytes the peer can still take.
    peer_window: usize,
    /// Receive window the peer still holds. Never revoked: shrinking
    /// `rx_cap` only withholds future credit.
    granted: usize,
    backlog: VecDeque<ConnId>,
    backlog_cap: usize,
    datagrams: VecDeque<(SocketAddr, Vec<u8>)>,
    error: Option<ZtsError>,
    rd_shut: bool,
    wr_shut: bool,
    peer_fin: bool,
    fin_sent: bool,
    /// Set by a graceful close: drain deadline.
    closing: Option<Instant>,
    connect_deadline: Option<Instant>,
}

impl Conn {
    fn new(kind: ConnKind, family: AddressFamily, cfg: &StackConfig) -> Self {
        Self {
            kind,
            family,
            phase: Phase::Idle,
            local: None,
            remote: None,
            parent: None,
            child: false,
            reuseaddr: false,
            rx: VecDeque::new(),
            rx_cap: cfg.recv_buffer,
            tx: VecDeque::new(),
            tx_cap: cfg.send_buffer,
            peer_window: 0,
            granted: 0,
            backlog: VecDeque::new(),
            backlog_cap: 0,
            datagrams: VecDeque::new(),
            error: None,
            rd_shut: false,
            wr_shut: false,
            peer_fin: false,
            fin_sent: false,
            closing: None,
            connect_deadline: None,
        }
    }
}

struct Interface {
    nwid: NetworkId,
    addr: AddressRecord,
    mtu: u32,
}

struct StackInner {
    cfg: StackConfig,
    conns: HashMap<ConnId, Conn>,
    next_id: u64,
    interfaces: Vec<Interface>,
    routes: HashMap<NetworkId, Vec<RouteRecord>>,
    next_port: u16,
    outbound: Vec<(NetworkId, IpAddr, Vec<u8>)>,
    changed: BTreeSet<ConnId>,
    released: Vec<ConnId>,
    dns: Vec<IpAddr>,
    hostname: String,
}

pub struct VirtualStack {
    inner: Mutex<StackInner>,
}

impl VirtualStack {
    pub fn new(cfg: StackConfig, hostname: &str) -> Self {
        Self {
            inner: Mutex::new(StackInner {
                cfg,
                conns: HashMap::new(),
                next_id: 1,
                interfaces: Vec::new(),
                routes: HashMap::new(),
                next_port: EPHEMERAL_PORT_MIN,
                outbound: Vec::new(),
                changed: BTreeSet::new(),
                released: Vec::new(),
                dns: Vec::new(),
                hostname: hostname.to_owned(),
            }),
        }
    }
}

fn unspecified(family: AddressFamily) -> IpAddr {
    match family {
        AddressFamily::Inet => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        AddressFamily::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

impl StackInner {
    fn conn(&self, id: ConnId) -> Result<&Conn> {
        self.conns
            .get(&id)
            .ok_or(ZtsError::InvalidArgument("unknown connection"))
    }

    fn conn_mut(&mut self, id: ConnId) -> Result<&mut Conn> {
        self.conns
            .get_mut(&id)
            .ok_or(ZtsError::InvalidArgument("unknown connection"))
    }

    fn alloc(&mut self, conn: Conn) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        self.conns.insert(id, conn);
        id
    }

    fn is_local(&self, ip: &IpAddr) -> bool {
        self.interfaces.iter().any(|i| i.addr.ip == *ip)
    }

    fn interface_of(&self, ip: &IpAddr) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.addr.ip == *ip)
    }

    /// Interface used to reach `dst`: a subnet that contains it, else the
    /// first same-family address of a network with a matching managed route.
    fn route(&self, dst: &IpAddr) -> Option<&Interface> {
        let family = AddressFamily::of(dst);
        if let Some(i) = self
            .interfaces
            .iter()
            .find(|i| i.addr.family() == family && i.addr.contains(dst))
        {
            return Some(i);
        }
        let nwid = self
            .routes
            .iter()
            .find(|(_, routes)| routes.iter().any(|r| r.contains(dst)))
            .map(|(nwid, _)| *nwid)?;
        self.interfaces
            .iter()
            .find(|i| i.nwid == nwid && i.addr.family() == family)
    }

    fn mss(&self, local: &IpAddr) -> usize {
        self.interface_of(local)
            .map(|i| i.mtu.saturating_sub(HEADER_OVERHEAD) as usize)
            .unwrap_or(0)
            .max(MIN_SEGMENT)
    }

    fn emit(&mut self, src: SocketAddr, dst: SocketAddr, segment: Segment) {
        let Some(nwid) = self.interface_of(&src.ip()).map(|i| i.nwid) else {
            trace!(%src, %dst, "no interface for source, dropping segment");
            return;
        };
        match encode_frame(&Packet::new(src.ip(), dst.ip(), segment)) {
            Ok(frame) => self.outbound.push((nwid, dst.ip(), frame)),
            Err(e) => warn!(%src, %dst, error = %e, "segment encode failed"),
        }
    }

    fn port_in_use(
        &self,
        except: ConnId,
        kind: ConnKind,
        family: AddressFamily,
        ip: IpAddr,
        port: u16,
        reuse: bool,
    ) -> bool {
        self.conns.iter().any(|(id, c)| {
            *id != except
                && !c.child
                && c.kind == kind
                && c.family == family
                && c.local.is_some_and(|l| {
                    l.port() == port
                        && (l.ip().is_unspecified() || ip.is_unspecified() || l.ip() == ip)
                })
                && !(reuse && c.reuseaddr)
        })
    }

    fn ephemeral_port(
        &mut self,
        id: ConnId,
        kind: ConnKind,
        family: AddressFamily,
        ip: IpAddr,
    ) -> Result<u16> {
        let span = u32::from(EPHEMERAL_PORT_MAX - EPHEMERAL_PORT_MIN) + 1;
        for _ in 0..span {
            let port = self.next_port;
            self.next_port = if port == EPHEMERAL_PORT_MAX {
                EPHEMERAL_PORT_MIN
            } else {
                port + 1
            };
            if !self.port_in_use(id, kind, family, ip, port, false) {
                return Ok(port);
            }
        }
        Err(ZtsError::AddrInUse)
    }

    fn auto_bind(&mut self, id: ConnId, ip: IpAddr) -> Result<SocketAddr> {
        let (kind, family) = {
            let c = self.conn(id)?;
            (c.kind, c.family)
        };
        let port = self.ephemeral_port(id, kind, family, ip)?;
        let local = SocketAddr::new(ip, port);
        self.conn_mut(id)?.local = Some(local);
        Ok(local)
    }

    fn fail(&mut self, id: ConnId, err: ZtsError) {
        if let Some(c) = self.conns.get_mut(&id) {
            debug!(conn = id.0, error = %err, "connection failed");
            c.phase = Phase::Failed;
            c.error = Some(err);
            c.connect_deadline = None;
            self.changed.insert(id);
        }
    }

    fn release(&mut self, id: ConnId) {
        if let Some(c) = self.conns.remove(&id) {
            if let Some(parent) = c.parent {
                if let Some(l) = self.conns.get_mut(&parent) {
                    l.backlog.retain(|b| *b != id);
                }
            }
            trace!(conn = id.0, "connection released");
            self.changed.remove(&id);
            self.released.push(id);
        }
    }

    fn find_stream(&self, local: SocketAddr, remote: SocketAddr) -> Option<ConnId> {
        self.conns
            .iter()
            .find(|(_, c)| {
                c.kind == ConnKind::Stream
                    && c.phase != Phase::Listening
                    && c.local == Some(local)
                    && c.remote == Some(remote)
            })
            .map(|(id, _)| *id)
    }

    fn find_listener(&self, dst: SocketAddr) -> Option<ConnId> {
        let family = AddressFamily::of(&dst.ip());
        self.conns
            .iter()
            .find(|(_, c)| {
                c.kind == ConnKind::Stream
                    && c.phase == Phase::Listening
                    && c.family == family
                    && c.local.is_some_and(|l| {
                        l.port() == dst.port() && (l.ip().is_unspecified() || l.ip() == dst.ip())
                    })
            })
            .map(|(id, _)| *id)
    }

    fn find_datagram(&self, dst: SocketAddr, src: SocketAddr) -> Option<ConnId> {
        let family = AddressFamily::of(&dst.ip());
        self.conns
            .iter()
            .find(|(_, c)| {
                c.kind == ConnKind::Datagram
                    && c.family == family
                    && c.local.is_some_and(|l| {
                        l.port() == dst.port() && (l.ip().is_unspecified() || l.ip() == dst.ip())
                    })
                    && c.remote.map_or(true, |r| r == src)
            })
            .map(|(id, _)| *id)
    }

    fn on_syn(&mut self, dst: SocketAddr, src: SocketAddr, window: u32) {
        if self.find_stream(dst, src).is_some() {
            return;
        }
        let Some(lid) = self.find_listener(dst) else {
            debug!(%dst, peer = %src, "no listener, refusing connection");
            self.emit(dst, src, Segment::Rst {
                src_port: dst.port(),
                dst_port: src.port(),
            });
            return;
        };
        let (queued, cap, rx_cap) = {
            let l = &self.conns[&lid];
            (l.backlog.len(), l.backlog_cap, l.rx_cap)
        };
        if queued >= cap {
            warn!(listener = %dst, peer = %src, backlog = cap, "backlog full, refusing connection");
            self.emit(dst, src, Segment::Rst {
                src_port: dst.port(),
                dst_port: src.port(),
            });
            return;
        }
        let family = AddressFamily::of(&dst.ip());
        let mut child = Conn::new(ConnKind::Stream, family, &self.cfg);
        child.phase = Phase::Established;
        child.local = Some(dst);
        child.remote = Some(src);
        child.parent = Some(lid);
        child.child = true;
        child.rx_cap = rx_cap;
        child.granted = rx_cap;
        child.peer_window = window as usize;
        let cid = self.alloc(child);
        if let Some(l) = self.conns.get_mut(&lid) {
            l.backlog.push_back(cid);
        }
        debug!(listener = %dst, peer = %src, conn = cid.0, "connection queued");
        self.emit(dst, src, Segment::SynAck {
            src_port: dst.port(),
            dst_port: src.port(),
            window: rx_cap.min(u32::MAX as usize) as u32,
        });
        self.changed.insert(lid);
    }

    fn on_segment(&mut self, id: ConnId, segment: Segment) {
        let Some(c) = self.conns.get_mut(&id) else {
            return;
        };
        match segment {
            Segment::SynAck { window, .. } => {
                if c.phase == Phase::SynSent {
                    c.phase = Phase::Established;
                    c.peer_window = window as usize;
                    c.connect_deadline = None;
                    self.changed.insert(id);
                }
            }
            Segment::Rst { .. } => {
                if c.closing.is_some() || c.parent.is_some() {
                    self.release(id);
                    return;
                }
                match c.phase {
                    Phase::SynSent => self.fail(id, ZtsError::ConnectionRefused),
                    Phase::Established => self.fail(id, ZtsError::ConnectionReset),
                    _ => {}
                }
            }
            Segment::Data { payload, .. } => {
                if c.phase != Phase::Established {
                    return;
                }
                if payload.len() > c.granted {
                    trace!(conn = id.0, excess = payload.len() - c.granted, "data beyond granted window");
                }
                c.granted = c.granted.saturating_sub(payload.len());
                if !c.rd_shut {
                    c.rx.extend(payload);
                }
                self.changed.insert(id);
            }
            Segment::Window { consumed, .. } => {
                c.peer_window += consumed as usize;
                self.changed.insert(id);
            }
            Segment::Fin { .. } => {
                c.peer_fin = true;
                self.changed.insert(id);
            }
            Segment::Syn { .. } | Segment::Datagram { .. } => {}
        }
    }

    fn ingest(&mut self, frame: &[u8]) {
        let packet = match decode_exact(frame) {
            Ok(p) => p,
            Err(e) => {
                trace!(error = %e, "dropping undecodable frame");
                return;
            }
        };
        if !self.is_local(&packet.dst) {
            trace!(dst = %packet.dst, "dropping frame for foreign address");
            return;
        }
        let (sport, dport) = packet.segment.ports();
        let src = SocketAddr::new(packet.src, sport);
        let dst = SocketAddr::new(packet.dst, dport);
        match packet.segment {
            Segment::Datagram { payload, .. } => {
                let Some(id) = self.find_datagram(dst, src) else {
                    trace!(%dst, "no datagram socket bound, dropping");
                    return;
                };
                let Some(c) = self.conns.get_mut(&id) else {
                    return;
                };
                if c.rd_shut {
                    return;
                }
                if c.datagrams.len() >= MAX_QUEUED_DATAGRAMS {
                    trace!(conn = id.0, "datagram queue full, dropping");
                    return;
                }
                c.datagrams.push_back((src, payload));
                self.changed.insert(id);
            }
            Segment::Syn { window, .. } => self.on_syn(dst, src, window),
            segment => match self.find_stream(dst, src) {
                Some(id) => self.on_segment(id, segment),
                None => {
                    if !matches!(segment, Segment::Rst { .. }) {
                        self.emit(dst, src, Segment::Rst {
                            src_port: dport,
                            dst_port: sport,
                        });
                    }
                }
            },
        }
    }

    fn flush(&mut self, id: ConnId) {
        let mss = match self.conns.get(&id).and_then(|c| c.local) {
            Some(l) => self.mss(&l.ip()),
            None => return,
        };
        let Some(c) = self.conns.get_mut(&id) else {
            return;
        };
        if c.phase != Phase::Established {
            return;
        }
        let (Some(local), Some(remote)) = (c.local, c.remote) else {
            return;
        };
        let (sport, dport) = (local.port(), remote.port());
        let mut segments = Vec::new();
        let mut drained = false;
        while c.peer_window > 0 && !c.tx.is_empty() {
            let n = mss.min(c.peer_window).min(c.tx.len());
            let payload: Vec<u8> = c.tx.drain(..n).collect();
            c.peer_window -= n;
            drained = true;
            segments.push(Segment::Data {
                src_port: sport,
                dst_port: dport,
                payload,
            });
        }
        if c.tx.is_empty() && (c.wr_shut || c.closing.is_some()) && !c.fin_sent {
            c.fin_sent = true;
            segments.push(Segment::Fin {
                src_port: sport,
                dst_port: dport,
            });
        }
        let credit = c.rx_cap.saturating_sub(c.rx.len() + c.granted).min(u32::MAX as usize);
        if credit > 0 && !c.peer_fin {
            c.granted += credit;
            segments.push(Segment::Window {
                src_port: sport,
                dst_port: dport,
                consumed: credit as u32,
            });
        }
        if drained {
            self.changed.insert(id);
        }
        for s in segments {
            self.emit(local, remote, s);
        }
    }

    fn tick(&mut self, now: Instant) {
        let mut ids: Vec<ConnId> = self.conns.keys().copied().collect();
        ids.sort();
        for id in ids {
            let Some(c) = self.conns.get(&id) else {
                continue;
            };
            if c.phase == Phase::SynSent && c.connect_deadline.is_some_and(|d| now >= d) {
                let (local, remote) = (c.local, c.remote);
                self.fail(id, ZtsError::Timeout);
                if let (Some(l), Some(r)) = (local, remote) {
                    self.emit(l, r, Segment::Rst {
                        src_port: l.port(),
                        dst_port: r.port(),
                    });
                }
                continue;
            }
            self.flush(id);
            let Some(c) = self.conns.get(&id) else {
                continue;
            };
            if let Some(deadline) = c.closing {
                if c.phase != Phase::Established || (c.tx.is_empty() && c.fin_sent) {
                    self.release(id);
                } else if now >= deadline {
                    let (local, remote) = (c.local, c.remote);
                    debug!(conn = id.0, "close drain timed out, resetting");
                    if let (Some(l), Some(r)) = (local, remote) {
                        self.emit(l, r, Segment::Rst {
                            src_port: l.port(),
                            dst_port: r.port(),
                        });
                    }
                    self.release(id);
                }
            }
        }
    }

    fn drop_interface(&mut self, ip: IpAddr) {
        self.interfaces.retain(|i| i.addr.ip != ip);
        let affected: Vec<(ConnId, Phase, bool)> = self
            .conns
            .iter()
            .filter(|(_, c)| c.kind == ConnKind::Stream && c.local.is_some_and(|l| l.ip() == ip))
            .map(|(id, c)| (*id, c.phase, c.closing.is_some()))
            .collect();
        for (id, phase, closing) in affected {
            if closing {
                self.release(id);
                continue;
            }
            match phase {
                Phase::SynSent => self.fail(id, ZtsError::HostUnreachable),
                Phase::Established => self.fail(id, ZtsError::ConnectionReset),
                _ => {}
            }
        }
    }
}

impl NetStack for VirtualStack {
    fn create(&self, kind: ConnKind, family: AddressFamily) -> Result<ConnId> {
        let mut s = self.inner.lock();
        let conn = Conn::new(kind, family, &s.cfg);
        let id = s.alloc(conn);
        trace!(conn = id.0, ?kind, ?family, "connection created");
        Ok(id)
    }

    fn bind(&self, id: ConnId, addr: SocketAddr) -> Result<SocketAddr> {
        let mut s = self.inner.lock();
        let (kind, family, reuse, bound) = {
            let c = s.conn(id)?;
            (c.kind, c.family, c.reuseaddr, c.local.is_some())
        };
        if !family.matches(&addr) {
            return Err(ZtsError::InvalidArgument("address family mismatch"));
        }
        if bound {
            return Err(ZtsError::InvalidOperation("socket already bound"));
        }
        let ip = addr.ip();
        if !ip.is_unspecified() && !s.is_local(&ip) {
            return Err(ZtsError::AddrNotAvailable);
        }
        if addr.port() == 0 {
            return s.auto_bind(id, ip);
        }
        if s.port_in_use(id, kind, family, ip, addr.port(), reuse) {
            return Err(ZtsError::AddrInUse);
        }
        s.conn_mut(id)?.local = Some(addr);
        Ok(addr)
    }

    fn listen(&self, id: ConnId, backlog: usize) -> Result<()> {
        let mut s = self.inner.lock();
        let (kind, phase, local, family) = {
            let c = s.conn(id)?;
            (c.kind, c.phase, c.local, c.family)
        };
        if kind != ConnKind::Stream {
            return Err(ZtsError::InvalidOperation("listen on a datagram socket"));
        }
        if !matches!(phase, Phase::Idle | Phase::Listening) {
            return Err(ZtsError::InvalidOperation("socket cannot listen in this state"));
        }
        if local.is_none() {
            s.auto_bind(id, unspecified(family))?;
        }
        let c = s.conn_mut(id)?;
        c.phase = Phase::Listening;
        c.backlog_cap = backlog.max(1);
        Ok(())
    }

    fn connect(&self, id: ConnId, addr: SocketAddr, timeout: Duration) -> Result<()> {
        let mut s = self.inner.lock();
        let (kind, family, phase, local, rx_cap) = {
            let c = s.conn(id)?;
            (c.kind, c.family, c.phase, c.local, c.rx_cap)
        };
        if !family.matches(&addr) {
            return Err(ZtsError::InvalidArgument("address family mismatch"));
        }
        if addr.port() == 0 || addr.ip().is_unspecified() {
            return Err(ZtsError::InvalidArgument("destination must be a concrete address"));
        }
        if kind == ConnKind::Datagram {
            if local.is_none() {
                s.auto_bind(id, unspecified(family))?;
            }
            s.conn_mut(id)?.remote = Some(addr);
            return Ok(());
        }
        if phase != Phase::Idle {
            return Err(ZtsError::InvalidOperation("socket cannot connect in this state"));
        }
        let Some(src_ip) = s.route(&addr.ip()).map(|i| i.addr.ip) else {
            debug!(dst = %addr, "no route to host");
            return Err(ZtsError::HostUnreachable);
        };
        let local = match local {
            Some(l) if !l.ip().is_unspecified() => l,
            Some(l) => SocketAddr::new(src_ip, l.port()),
            None => {
                let port = s.ephemeral_port(id, kind, family, src_ip)?;
                SocketAddr::new(src_ip, port)
            }
        };
        let c = s.conn_mut(id)?;
        c.local = Some(local);
        c.remote = Some(addr);
        c.granted = rx_cap;
        c.phase = Phase::SynSent;
        c.connect_deadline = Some(Instant::now() + timeout);
        debug!(conn = id.0, %local, remote = %addr, "connecting");
        s.emit(local, addr, Segment::Syn {
            src_port: local.port(),
            dst_port: addr.port(),
            window: rx_cap.min(u32::MAX as usize) as u32,
        });
        Ok(())
    }

    fn accept(&self, id: ConnId) -> Result<Option<(ConnId, SocketAddr)>> {
        let mut s = self.inner.lock();
        if s.conn(id)?.phase != Phase::Listening {
            return Err(ZtsError::InvalidOperation("socket is not listening"));
        }
        while let Some(child) = s.conn_mut(id)?.backlog.pop_front() {
            if let Some(c) = s.conns.get_mut(&child) {
                c.parent = None;
                if let Some(remote) = c.remote {
                    return Ok(Some((child, remote)));
                }
            }
        }
        Ok(None)
    }

    fn send(&self, id: ConnId, data: &[u8], dst: Option<SocketAddr>) -> Result<usize> {
        let mut s = self.inner.lock();
        let c = s.conn_mut(id)?;
        match c.kind {
            ConnKind::Stream => {
                if c.wr_shut || c.closing.is_some() {
                    return Err(ZtsError::BrokenPipe);
                }
                match c.phase {
                    Phase::Established => {}
                    Phase::Failed => return Err(ZtsError::BrokenPipe),
                    _ => return Err(ZtsError::NotConnected),
                }
                let room = c.tx_cap.saturating_sub(c.tx.len());
                if room == 0 {
                    return Err(ZtsError::WouldBlock);
                }
                let n = room.min(data.len());
                c.tx.extend(&data[..n]);
                Ok(n)
            }
            ConnKind::Datagram => {
                if c.wr_shut {
                    return Err(ZtsError::BrokenPipe);
                }
                let target = dst.or(c.remote).ok_or(ZtsError::NotConnected)?;
                if !c.family.matches(&target) {
                    return Err(ZtsError::InvalidArgument("address family mismatch"));
                }
                if data.len() > MAX_DATAGRAM_LEN {
                    return Err(ZtsError::InvalidArgument("datagram too large"));
                }
                let (family, bound) = (c.family, c.local);
                let local = match bound {
                    Some(l) => l,
                    None => s.auto_bind(id, unspecified(family))?,
                };
                let src_ip = if local.ip().is_unspecified() {
                    s.route(&target.ip())
                        .map(|i| i.addr.ip)
                        .ok_or(ZtsError::HostUnreachable)?
                } else {
                    local.ip()
                };
                s.emit(SocketAddr::new(src_ip, local.port()), target, Segment::Datagram {
                    src_port: local.port(),
                    dst_port: target.port(),
                    payload: data.to_vec(),
                });
                Ok(data.len())
            }
        }
    }

    fn recv(&self, id: ConnId, buf: &mut [u8], peek: bool) -> Result<(usize, Option<SocketAddr>)> {
        let mut s = self.inner.lock();
        let c = s.conn_mut(id)?;
        match c.kind {
            ConnKind::Stream => {
                if !matches!(c.phase, Phase::Established | Phase::Failed) {
                    return Err(ZtsError::NotConnected);
                }
                if !c.rx.is_empty() {
                    let n = buf.len().min(c.rx.len());
                    for (d, b) in buf.iter_mut().zip(c.rx.iter()) {
                        *d = *b;
                    }
                    if !peek {
                        c.rx.drain(..n);
                    }
                    return Ok((n, c.remote));
                }
                if c.rd_shut || c.peer_fin {
                    return Ok((0, c.remote));
                }
                if c.phase == Phase::Failed {
                    return Err(ZtsError::ConnectionReset);
                }
                Err(ZtsError::WouldBlock)
            }
            ConnKind::Datagram => {
                let Some((src, payload)) = c.datagrams.front() else {
                    if c.rd_shut {
                        return Ok((0, None));
                    }
                    return Err(ZtsError::WouldBlock);
                };
                let src = *src;
                let n = buf.len().min(payload.len());
                buf[..n].copy_from_slice(&payload[..n]);
                if !peek {
                    c.datagrams.pop_front();
                }
                Ok((n, Some(src)))
            }
        }
    }

    fn shutdown(&self, id: ConnId, read: bool, write: bool) -> Result<()> {
        let mut s = self.inner.lock();
        let c = s.conn_mut(id)?;
        if c.kind == ConnKind::Stream && c.phase != Phase::Established {
            return Err(ZtsError::NotConnected);
        }
        if read {
            c.rd_shut = true;
            c.rx.clear();
            c.datagrams.clear();
        }
        if write {
            c.wr_shut = true;
        }
        Ok(())
    }

    fn close(&self, id: ConnId, abortive: bool) {
        let mut s = self.inner.lock();
        let Some(c) = s.conns.get_mut(&id) else {
            return;
        };
        match (c.kind, c.phase) {
            (ConnKind::Stream, Phase::Listening) => {
                let children: Vec<ConnId> = c.backlog.drain(..).collect();
                for child in children {
                    let ends = s.conns.get(&child).map(|ch| (ch.local, ch.remote));
                    if let Some((Some(l), Some(r))) = ends {
                        s.emit(l, r, Segment::Rst {
                            src_port: l.port(),
                            dst_port: r.port(),
                        });
                    }
                    s.release(child);
                }
                s.release(id);
            }
            (ConnKind::Stream, Phase::Established) if !abortive => {
                c.closing = Some(Instant::now() + CLOSE_DRAIN_TIMEOUT);
                c.rd_shut = true;
                c.rx.clear();
                trace!(conn = id.0, "graceful close queued");
            }
            (ConnKind::Stream, Phase::Established | Phase::SynSent) => {
                let ends = (c.local, c.remote);
                if let (Some(l), Some(r)) = ends {
                    s.emit(l, r, Segment::Rst {
                        src_port: l.port(),
                        dst_port: r.port(),
                    });
                }
                s.release(id);
            }
            _ => s.release(id),
        }
    }

    fn state(&self, id: ConnId) -> ConnState {
        let s = self.inner.lock();
        match s.conns.get(&id).map(|c| c.phase) {
            Some(Phase::Idle) => ConnState::Idle,
            Some(Phase::Listening) => ConnState::Listening,
            Some(Phase::SynSent) => ConnState::Connecting,
            Some(Phase::Established) => ConnState::Established,
            Some(Phase::Failed) | None => ConnState::Failed,
        }
    }

    fn readiness(&self, id: ConnId) -> Readiness {
        let s = self.inner.lock();
        let Some(c) = s.conns.get(&id) else {
            return Readiness {
                readable: true,
                writable: true,
                error: true,
            };
        };
        let error = c.error.is_some();
        match (c.kind, c.phase) {
            (ConnKind::Stream, Phase::Listening) => Readiness {
                readable: !c.backlog.is_empty(),
                writable: false,
                error,
            },
            (ConnKind::Stream, Phase::Established) => Readiness {
                readable: !c.rx.is_empty() || c.peer_fin || c.rd_shut,
                writable: !c.wr_shut && c.tx.len() < c.tx_cap,
                error,
            },
            (ConnKind::Stream, Phase::Failed) => Readiness {
                readable: true,
                writable: true,
                error,
            },
            (ConnKind::Stream, _) => Readiness {
                error,
                ..Readiness::default()
            },
            (ConnKind::Datagram, _) => Readiness {
                readable: !c.datagrams.is_empty() || c.rd_shut,
                writable: !c.wr_shut,
                error,
            },
        }
    }

    fn take_error(&self, id: ConnId) -> Option<ZtsError> {
        self.inner.lock().conns.get_mut(&id).and_then(|c| c.error.take())
    }

    fn bytes_readable(&self, id: ConnId) -> usize {
        let s = self.inner.lock();
        match s.conns.get(&id) {
            Some(c) if c.kind == ConnKind::Stream => c.rx.len(),
            Some(c) => c.datagrams.front().map_or(0, |(_, p)| p.len()),
            None => 0,
        }
    }

    fn local_addr(&self, id: ConnId) -> Option<SocketAddr> {
        self.inner.lock().conns.get(&id).and_then(|c| c.local)
    }

    fn peer_addr(&self, id: ConnId) -> Option<SocketAddr> {
        self.inner.lock().conns.get(&id).and_then(|c| c.remote)
    }

    fn set_reuseaddr(&self, id: ConnId, on: bool) {
        if let Some(c) = self.inner.lock().conns.get_mut(&id) {
            c.reuseaddr = on;
        }
    }

    fn set_recv_buffer(&self, id: ConnId, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Err(ZtsError::InvalidArgument("receive buffer must be positive"));
        }
        let mut s = self.inner.lock();
        s.conn_mut(id)?.rx_cap = bytes;
        Ok(())
    }

    fn recv_buffer(&self, id: ConnId) -> usize {
        let s = self.inner.lock();
        s.conns.get(&id).map_or(s.cfg.recv_buffer, |c| c.rx_cap)
    }

    fn add_address(&self, nwid: NetworkId, addr: AddressRecord, mtu: u32) {
        let mut s = self.inner.lock();
        if let Some(i) = s
            .interfaces
            .iter_mut()
            .find(|i| i.nwid == nwid && i.addr.ip == addr.ip)
        {
            i.addr = addr;
            i.mtu = mtu;
            return;
        }
        debug!(network = %nwid, ip = %addr.ip, prefix = addr.prefix_len, mtu, "interface address up");
        s.interfaces.push(Interface { nwid, addr, mtu });
    }

    fn remove_address(&self, nwid: NetworkId, ip: IpAddr) {
        let mut s = self.inner.lock();
        if s.interfaces.iter().any(|i| i.nwid == nwid && i.addr.ip == ip) {
            debug!(network = %nwid, %ip, "interface address down");
            s.drop_interface(ip);
        }
    }

    fn remove_network(&self, nwid: NetworkId) {
        let mut s = self.inner.lock();
        let ips: Vec<IpAddr> = s
            .interfaces
            .iter()
            .filter(|i| i.nwid == nwid)
            .map(|i| i.addr.ip)
            .collect();
        for ip in ips {
            s.drop_interface(ip);
        }
        s.routes.remove(&nwid);
    }

    fn set_routes(&self, nwid: NetworkId, routes: &[RouteRecord]) {
        let mut s = self.inner.lock();
        if routes.is_empty() {
            s.routes.remove(&nwid);
        } else {
            s.routes.insert(nwid, routes.to_vec());
        }
    }

    fn is_local(&self, ip: &IpAddr) -> bool {
        self.inner.lock().is_local(ip)
    }

    fn ingest(&self, _nwid: NetworkId, frame: &[u8]) {
        self.inner.lock().ingest(frame);
    }

    fn unreachable(&self, nwid: NetworkId, dst: IpAddr) {
        let mut s = self.inner.lock();
        let pending: Vec<ConnId> = s
            .conns
            .iter()
            .filter(|(_, c)| c.phase == Phase::SynSent && c.remote.is_some_and(|r| r.ip() == dst))
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            debug!(network = %nwid, %dst, conn = id.0, "destination unreachable");
            s.fail(id, ZtsError::HostUnreachable);
        }
    }

    fn poll(&self, now: Instant) -> StackPoll {
        let mut s = self.inner.lock();
        s.tick(now);
        let mut events: Vec<StackEvent> = s.changed.iter().map(|id| StackEvent::Changed(*id)).collect();
        s.changed.clear();
        events.extend(s.released.drain(..).map(StackEvent::Released));
        StackPoll {
            outbound: std::mem::take(&mut s.outbound),
            events,
        }
    }

    fn add_dns_nameserver(&self, addr: IpAddr) -> Result<()> {
        let mut s = self.inner.lock();
        if s.dns.contains(&addr) {
            return Ok(());
        }
        if s.dns.len() >= MAX_DNS_NAMESERVERS {
            return Err(ZtsError::InvalidOperation("nameserver list is full"));
        }
        s.dns.push(addr);
        Ok(())
    }

    fn del_dns_nameserver(&self, addr: IpAddr) -> Result<()> {
        let mut s = self.inner.lock();
        let pos = s
            .dns
            .iter()
            .position(|a| *a == addr)
            .ok_or(ZtsError::InvalidArgument("nameserver not configured"))?;
        s.dns.remove(pos);
        Ok(())
    }

    fn dns_nameservers(&self) -> Vec<IpAddr> {
        self.inner.lock().dns.clone()
    }

    fn hostname(&self) -> String {
        self.inner.lock().hostname.clone()
    }

    fn set_hostname(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > MAX_HOSTNAME_LEN {
            return Err(ZtsError::InvalidArgument("hostname must be 1-255 bytes"));
        }
        self.inner.lock().hostname = name.to_owned();
        Ok(())
    }
}
