//! Virtual socket table.
//!
//! Handles index an arena of generation-checked slots. A closed handle stays
//! `Draining` until the stack reports its connection released, so a handle is
//! never reassigned while teardown is still in flight and a stale readiness
//! notification can never reach a new occupant.
//!
//! Lock order: socket lock, then the slot table, then the connection map. The
//! stack lock is a leaf. The driver takes the connection map and the slot
//! table one at a time and only then the socket lock, to notify waiters.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, trace};

use crate::config::ServiceConfig;
use crate::error::{Result, ZtsError};
use crate::model::{
    AddressFamily, F_GETFL, F_SETFL, FIONBIO, FIONREAD, IPPROTO_IP, IPPROTO_TCP, IPPROTO_UDP,
    MSG_DONTWAIT, MSG_OOB, MSG_PEEK, MSG_WAITALL, O_NONBLOCK, SHUT_RD, SHUT_RDWR, SHUT_WR,
    SOCK_DGRAM, SOCK_STREAM,
};
use crate::options::{OptionValue, SockOpt, SocketOptions};
use crate::overlay::Waker;
use crate::service::Gate;
use crate::stack::{ConnId, ConnKind, ConnState, NetStack, Readiness};

/// Application-visible socket handle.
pub type Handle = i32;

/// Extra time a blocking connect waits past the stack's own timeout, so the
/// stack's verdict is what the caller sees.
const CONNECT_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Created,
    Bound,
    Listening,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Handle set for `select`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdSet(BTreeSet<Handle>);

impl FdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fd: Handle) {
        self.0.insert(fd);
    }

    pub fn remove(&mut self, fd: Handle) {
        self.0.remove(&fd);
    }

    pub fn contains(&self, fd: Handle) -> bool {
        self.0.contains(&fd)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Handle> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Handle> for FdSet {
    fn from_iter<I: IntoIterator<Item = Handle>>(iter: I) -> Self {
        FdSet(iter.into_iter().collect())
    }
}

struct VirtualSocket {
    state: SocketState,
    nonblocking: bool,
    /// close() ran; waiters bail out.
    closed: bool,
    /// The stack dropped the connection on its own.
    released: bool,
    options: SocketOptions,
}

struct SocketEntry {
    conn: ConnId,
    kind: ConnKind,
    family: AddressFamily,
    inner: Mutex<VirtualSocket>,
    cv: Condvar,
}

enum Slot {
    Vacant { generation: u32 },
    Live { generation: u32, entry: Arc<SocketEntry> },
    Draining { generation: u32 },
}

impl Slot {
    fn generation(&self) -> u32 {
        match self {
            Slot::Vacant { generation }
            | Slot::Live { generation, .. }
            | Slot::Draining { generation } => *generation,
        }
    }
}

#[derive(Default)]
struct Slots {
    entries: Vec<Slot>,
    /// Recycled indices in release order.
    free: VecDeque<usize>,
}

/// Select epoch: bumped on every readiness notification.
#[derive(Default)]
struct ReadyHub {
    epoch: Mutex<u64>,
    cv: Condvar,
}

impl ReadyHub {
    fn current(&self) -> u64 {
        *self.epoch.lock()
    }

    fn bump(&self) {
        let mut e = self.epoch.lock();
        *e = e.wrapping_add(1);
        self.cv.notify_all();
    }

    fn wait(&self, seen: u64, deadline: Option<Instant>) {
        let mut e = self.epoch.lock();
        while *e == seen {
            match deadline {
                Some(d) => {
                    if self.cv.wait_until(&mut e, d).timed_out() {
                        return;
                    }
                }
                None => self.cv.wait(&mut e),
            }
        }
    }
}

fn unspecified(family: AddressFamily) -> IpAddr {
    match family {
        AddressFamily::Inet => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        AddressFamily::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

fn check_flags(flags: i32) -> Result<()> {
    if flags & (MSG_WAITALL | MSG_OOB) != 0 {
        return Err(ZtsError::InvalidArgument("MSG_WAITALL and MSG_OOB are not supported"));
    }
    Ok(())
}

pub struct SocketTable {
    stack: Arc<dyn NetStack>,
    gate: Arc<Gate>,
    kick: Waker,
    slots: RwLock<Slots>,
    by_conn: Mutex<HashMap<ConnId, (usize, u32)>>,
    ready: ReadyHub,
    max_sockets: usize,
    max_backlog: usize,
    connect_timeout: Duration,
}

impl SocketTable {
    pub(crate) fn new(stack: Arc<dyn NetStack>, gate: Arc<Gate>, kick: Waker, cfg: &ServiceConfig) -> Self {
        Self {
            stack,
            gate,
            kick,
            slots: RwLock::new(Slots::default()),
            by_conn: Mutex::new(HashMap::new()),
            ready: ReadyHub::default(),
            max_sockets: cfg.max_sockets,
            max_backlog: cfg.max_backlog,
            connect_timeout: cfg.connect_timeout(),
        }
    }

    fn entry(&self, fd: Handle) -> Result<Arc<SocketEntry>> {
        let slots = self.slots.read();
        match usize::try_from(fd).ok().and_then(|i| slots.entries.get(i)) {
            Some(Slot::Live { entry, .. }) => Ok(entry.clone()),
            _ => Err(ZtsError::InvalidArgument("unknown socket")),
        }
    }

    fn open(&self, fd: Handle) -> Result<Arc<SocketEntry>> {
        self.gate.check()?;
        self.entry(fd)
    }

    fn insert(&self, conn: ConnId, kind: ConnKind, family: AddressFamily, state: SocketState, nonblocking: bool) -> Result<Handle> {
        let entry = Arc::new(SocketEntry {
            conn,
            kind,
            family,
            inner: Mutex::new(VirtualSocket {
                state,
                nonblocking,
                closed: false,
                released: false,
                options: SocketOptions::new(self.connect_timeout),
            }),
            cv: Condvar::new(),
        });
        let (idx, generation) = {
            let mut slots = self.slots.write();
            let idx = if slots.entries.len() < self.max_sockets {
                slots.entries.push(Slot::Vacant { generation: 0 });
                slots.entries.len() - 1
            } else if let Some(i) = slots.free.pop_front() {
                i
            } else {
                return Err(ZtsError::InvalidOperation("socket table full"));
            };
            let generation = slots.entries[idx].generation();
            slots.entries[idx] = Slot::Live { generation, entry };
            (idx, generation)
        };
        self.by_conn.lock().insert(conn, (idx, generation));
        Ok(idx as Handle)
    }

    /// Bring the socket state up to date with its connection.
    fn refresh(&self, e: &SocketEntry, s: &mut VirtualSocket) {
        if e.kind != ConnKind::Stream {
            return;
        }
        match (s.state, self.stack.state(e.conn)) {
            (SocketState::Connecting, ConnState::Established) => s.state = SocketState::Connected,
            (SocketState::Connecting | SocketState::Connected, ConnState::Failed) => {
                s.state = SocketState::Closing
            }
            _ => {}
        }
    }

    /// Sleep until the driver signals this socket. Fails when the service is
    /// no longer running, the socket was closed (`on_close`) or `deadline`
    /// has passed.
    fn wait(&self, e: &SocketEntry, s: &mut MutexGuard<'_, VirtualSocket>, deadline: Option<Instant>, on_close: ZtsError) -> Result<()> {
        self.gate.check()?;
        if s.closed {
            return Err(on_close);
        }
        match deadline {
            Some(d) if Instant::now() >= d => return Err(ZtsError::Timeout),
            Some(d) => {
                e.cv.wait_until(s, d);
            }
            None => e.cv.wait(s),
        }
        self.gate.check()?;
        if s.closed {
            return Err(on_close);
        }
        Ok(())
    }

    /// Create a socket. Stream and datagram sockets over IPv4 or IPv6.
    pub fn socket(&self, family: i32, ty: i32, protocol: i32) -> Result<Handle> {
        self.gate.check()?;
        let family = AddressFamily::from_raw(family)
            .ok_or(ZtsError::InvalidArgument("unsupported address family"))?;
        let kind = match (ty, protocol) {
            (SOCK_STREAM, IPPROTO_IP | IPPROTO_TCP) => ConnKind::Stream,
            (SOCK_DGRAM, IPPROTO_IP | IPPROTO_UDP) => ConnKind::Datagram,
            _ => return Err(ZtsError::InvalidArgument("unsupported socket type or protocol")),
        };
        let conn = self.stack.create(kind, family)?;
        match self.insert(conn, kind, family, SocketState::Created, false) {
            Ok(fd) => {
                debug!(fd, conn = conn.0, ?kind, ?family, "socket created");
                Ok(fd)
            }
            Err(e) => {
                self.stack.close(conn, true);
                Err(e)
            }
        }
    }

    pub fn bind(&self, fd: Handle, addr: SocketAddr) -> Result<()> {
        let e = self.open(fd)?;
        let mut s = e.inner.lock();
        if s.state != SocketState::Created {
            return Err(ZtsError::InvalidOperation("socket is already bound"));
        }
        let bound = self.stack.bind(e.conn, addr)?;
        s.state = SocketState::Bound;
        debug!(fd, local = %bound, "socket bound");
        Ok(())
    }

    pub fn listen(&self, fd: Handle, backlog: i32) -> Result<()> {
        let e = self.open(fd)?;
        if e.kind != ConnKind::Stream {
            return Err(ZtsError::InvalidOperation("listen on a datagram socket"));
        }
        let mut s = e.inner.lock();
        if !matches!(
            s.state,
            SocketState::Created | SocketState::Bound | SocketState::Listening
        ) {
            return Err(ZtsError::InvalidOperation("socket cannot listen in this state"));
        }
        let cap = usize::try_from(backlog).unwrap_or(0).clamp(1, self.max_backlog);
        self.stack.listen(e.conn, cap)?;
        s.state = SocketState::Listening;
        debug!(fd, backlog = cap, "socket listening");
        Ok(())
    }

    pub fn connect(&self, fd: Handle, addr: SocketAddr) -> Result<()> {
        let e = self.open(fd)?;
        let mut s = e.inner.lock();
        self.refresh(&e, &mut s);
        if e.kind == ConnKind::Datagram {
            self.stack.connect(e.conn, addr, s.options.connect_timeout)?;
            s.state = SocketState::Connected;
            debug!(fd, remote = %addr, "datagram peer set");
            return Ok(());
        }
        match s.state {
            SocketState::Created | SocketState::Bound => {}
            SocketState::Connecting => return Err(ZtsError::InProgress),
            SocketState::Connected => return Err(ZtsError::InvalidOperation("socket is already connected")),
            SocketState::Listening => return Err(ZtsError::InvalidOperation("socket is listening")),
            SocketState::Closing | SocketState::Closed => {
                return Err(ZtsError::InvalidOperation("socket is closing"))
            }
        }
        let timeout = s.options.connect_timeout;
        self.stack.connect(e.conn, addr, timeout)?;
        s.state = SocketState::Connecting;
        debug!(fd, remote = %addr, ?timeout, "connecting");
        (self.kick)();
        if s.nonblocking {
            return Err(ZtsError::InProgress);
        }
        let deadline = Instant::now() + timeout + CONNECT_GRACE;
        loop {
            self.refresh(&e, &mut s);
            match s.state {
                SocketState::Connected => return Ok(()),
                SocketState::Closing => {
                    let err = self
                        .stack
                        .take_error(e.conn)
                        .unwrap_or(ZtsError::ConnectionRefused);
                    debug!(fd, remote = %addr, error = %err, "connect failed");
                    return Err(err);
                }
                _ => {}
            }
            if let Err(err) = self.wait(&e, &mut s, Some(deadline), ZtsError::Closed) {
                if err == ZtsError::Timeout {
                    s.state = SocketState::Closing;
                }
                return Err(err);
            }
        }
    }

    pub fn accept(&self, fd: Handle) -> Result<(Handle, SocketAddr)> {
        self.accept4(fd, false)
    }

    /// Accept a queued connection; the new socket starts non-blocking when
    /// `nonblocking` is set.
    pub fn accept4(&self, fd: Handle, nonblocking: bool) -> Result<(Handle, SocketAddr)> {
        let e = self.open(fd)?;
        let mut s = e.inner.lock();
        if s.state != SocketState::Listening {
            return Err(ZtsError::InvalidOperation("socket is not listening"));
        }
        let deadline = s.options.recv_timeout.map(|t| Instant::now() + t);
        loop {
            match self.stack.accept(e.conn)? {
                Some((child, peer)) => {
                    let handle = match self.insert(child, ConnKind::Stream, e.family, SocketState::Connected, nonblocking) {
                        Ok(h) => h,
                        Err(err) => {
                            self.stack.close(child, true);
                            (self.kick)();
                            return Err(err);
                        }
                    };
                    debug!(listener = fd, fd = handle, %peer, "connection accepted");
                    return Ok((handle, peer));
                }
                None if s.nonblocking => return Err(ZtsError::WouldBlock),
                None => self.wait(&e, &mut s, deadline, ZtsError::Closed)?,
            }
        }
    }

    pub fn send(&self, fd: Handle, data: &[u8], flags: i32) -> Result<usize> {
        self.sendto(fd, data, flags, None)
    }

    pub fn write(&self, fd: Handle, data: &[u8]) -> Result<usize> {
        self.sendto(fd, data, 0, None)
    }

    /// Send to `dst`. Stream sockets ignore the address. Returns the number
    /// of bytes queued, which may be less than `data.len()`.
    pub fn sendto(&self, fd: Handle, data: &[u8], flags: i32, dst: Option<SocketAddr>) -> Result<usize> {
        check_flags(flags)?;
        let e = self.open(fd)?;
        if data.is_empty() {
            return Ok(0);
        }
        let mut s = e.inner.lock();
        self.refresh(&e, &mut s);
        let dst = if e.kind == ConnKind::Stream { None } else { dst };
        let nonblocking = s.nonblocking || flags & MSG_DONTWAIT != 0;
        let deadline = s.options.send_timeout.map(|t| Instant::now() + t);
        loop {
            match self.stack.send(e.conn, data, dst) {
                Ok(n) => {
                    trace!(fd, len = n, "send");
                    (self.kick)();
                    return Ok(n);
                }
                Err(ZtsError::WouldBlock) if !nonblocking => {
                    self.wait(&e, &mut s, deadline, ZtsError::BrokenPipe)?
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Gather-send of several buffers as one transfer.
    pub fn sendmsg(&self, fd: Handle, bufs: &[&[u8]], flags: i32, dst: Option<SocketAddr>) -> Result<usize> {
        let data: Vec<u8> = bufs.iter().flat_map(|b| b.iter().copied()).collect();
        self.sendto(fd, &data, flags, dst)
    }

    pub fn recv(&self, fd: Handle, buf: &mut [u8], flags: i32) -> Result<usize> {
        self.recvfrom(fd, buf, flags).map(|(n, _)| n)
    }

    pub fn read(&self, fd: Handle, buf: &mut [u8]) -> Result<usize> {
        self.recv(fd, buf, 0)
    }

    /// Receive into `buf`. `Ok(0)` at end of stream; datagrams longer than
    /// `buf` are truncated.
    pub fn recvfrom(&self, fd: Handle, buf: &mut [u8], flags: i32) -> Result<(usize, Option<SocketAddr>)> {
        check_flags(flags)?;
        let e = self.open(fd)?;
        if buf.is_empty() {
            return Ok((0, None));
        }
        let mut s = e.inner.lock();
        self.refresh(&e, &mut s);
        if e.kind == ConnKind::Stream
            && !matches!(s.state, SocketState::Connected | SocketState::Closing)
        {
            return Err(ZtsError::NotConnected);
        }
        let nonblocking = s.nonblocking || flags & MSG_DONTWAIT != 0;
        let peek = flags & MSG_PEEK != 0;
        let deadline = s.options.recv_timeout.map(|t| Instant::now() + t);
        loop {
            match self.stack.recv(e.conn, buf, peek) {
                Ok((n, from)) => {
                    trace!(fd, len = n, peek, "recv");
                    if n > 0 && !peek {
                        (self.kick)();
                    }
                    return Ok((n, from));
                }
                Err(ZtsError::WouldBlock) if !nonblocking => {
                    self.wait(&e, &mut s, deadline, ZtsError::Closed)?
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Scatter-receive into several buffers.
    pub fn recvmsg(&self, fd: Handle, bufs: &mut [&mut [u8]], flags: i32) -> Result<(usize, Option<SocketAddr>)> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut tmp = vec![0u8; total];
        let (n, from) = self.recvfrom(fd, &mut tmp, flags)?;
        let mut off = 0;
        for b in bufs.iter_mut() {
            if off >= n {
                break;
            }
            let take = b.len().min(n - off);
            b[..take].copy_from_slice(&tmp[off..off + take]);
            off += take;
        }
        Ok((n, from))
    }

    pub fn shutdown(&self, fd: Handle, how: i32) -> Result<()> {
        let (read, write) = match how {
            SHUT_RD => (true, false),
            SHUT_WR => (false, true),
            SHUT_RDWR => (true, true),
            _ => return Err(ZtsError::InvalidArgument("bad shutdown mode")),
        };
        let e = self.open(fd)?;
        let s = {
            let mut s = e.inner.lock();
            self.refresh(&e, &mut s);
            if e.kind == ConnKind::Stream && s.state != SocketState::Connected {
                return Err(ZtsError::NotConnected);
            }
            self.stack.shutdown(e.conn, read, write)?;
            e.cv.notify_all();
            s.state
        };
        debug!(fd, read, write, state = ?s, "socket shutdown");
        self.ready.bump();
        (self.kick)();
        Ok(())
    }

    /// Close a handle. Teardown is queued; the handle is recycled once the
    /// stack reports the connection released.
    pub fn close(&self, fd: Handle) -> Result<()> {
        let e = self.open(fd)?;
        let abortive = {
            let mut s = e.inner.lock();
            if s.closed {
                return Err(ZtsError::InvalidArgument("socket already closed"));
            }
            s.closed = true;
            s.state = SocketState::Closing;
            {
                let mut slots = self.slots.write();
                let Slots { entries, free } = &mut *slots;
                if let Some(slot) = usize::try_from(fd).ok().and_then(|i| entries.get_mut(i)) {
                    let generation = slot.generation();
                    if s.released {
                        *slot = Slot::Vacant {
                            generation: generation.wrapping_add(1),
                        };
                        free.push_back(fd as usize);
                    } else {
                        *slot = Slot::Draining { generation };
                    }
                }
            }
            e.cv.notify_all();
            s.options.abortive_close()
        };
        self.stack.close(e.conn, abortive);
        debug!(fd, conn = e.conn.0, abortive, "socket closed");
        self.ready.bump();
        (self.kick)();
        Ok(())
    }

    pub fn setsockopt(&self, fd: Handle, level: i32, name: i32, value: OptionValue) -> Result<()> {
        let e = self.open(fd)?;
        let opt = SockOpt::from_raw(level, name)?;
        if opt.is_read_only() {
            return Err(ZtsError::InvalidArgument("option is read-only"));
        }
        SocketOptions::check_applies(opt, e.kind, e.family)?;
        let mut s = e.inner.lock();
        match opt {
            SockOpt::RecvBuffer => {
                let bytes = usize::try_from(value.as_int()?)
                    .map_err(|_| ZtsError::InvalidArgument("receive buffer must be positive"))?;
                self.stack.set_recv_buffer(e.conn, bytes)?;
            }
            SockOpt::ReuseAddr => {
                s.options.set(opt, value)?;
                self.stack.set_reuseaddr(e.conn, s.options.reuseaddr);
            }
            _ => s.options.set(opt, value)?,
        }
        trace!(fd, ?opt, ?value, "option set");
        Ok(())
    }

    pub fn getsockopt(&self, fd: Handle, level: i32, name: i32) -> Result<OptionValue> {
        let e = self.open(fd)?;
        let opt = SockOpt::from_raw(level, name)?;
        SocketOptions::check_applies(opt, e.kind, e.family)?;
        let mut s = e.inner.lock();
        self.refresh(&e, &mut s);
        let value = match opt {
            SockOpt::Error => OptionValue::Int(self.stack.take_error(e.conn).map_or(0, |err| err.errno())),
            SockOpt::Type => OptionValue::Int(match e.kind {
                ConnKind::Stream => SOCK_STREAM,
                ConnKind::Datagram => SOCK_DGRAM,
            }),
            SockOpt::AcceptConn => OptionValue::Int(i32::from(s.state == SocketState::Listening)),
            SockOpt::RecvBuffer => {
                OptionValue::Int(i32::try_from(self.stack.recv_buffer(e.conn)).unwrap_or(i32::MAX))
            }
            _ => s
                .options
                .get(opt)
                .ok_or(ZtsError::InvalidArgument("unsupported socket option"))?,
        };
        Ok(value)
    }

    /// F_GETFL / F_SETFL with O_NONBLOCK.
    pub fn fcntl(&self, fd: Handle, cmd: i32, flags: i32) -> Result<i32> {
        let e = self.open(fd)?;
        let mut s = e.inner.lock();
        match cmd {
            F_GETFL => Ok(if s.nonblocking { O_NONBLOCK } else { 0 }),
            F_SETFL => {
                s.nonblocking = flags & O_NONBLOCK != 0;
                Ok(0)
            }
            _ => Err(ZtsError::InvalidArgument("unsupported fcntl command")),
        }
    }

    /// FIONREAD stores the readable byte count in `arg`; FIONBIO sets
    /// non-blocking mode from `*arg != 0`.
    pub fn ioctl(&self, fd: Handle, request: u64, arg: &mut i32) -> Result<()> {
        let e = self.open(fd)?;
        let mut s = e.inner.lock();
        match request {
            FIONREAD => {
                *arg = i32::try_from(self.stack.bytes_readable(e.conn)).unwrap_or(i32::MAX);
                Ok(())
            }
            FIONBIO => {
                s.nonblocking = *arg != 0;
                Ok(())
            }
            _ => Err(ZtsError::InvalidArgument("unsupported ioctl request")),
        }
    }

    pub fn getsockname(&self, fd: Handle) -> Result<SocketAddr> {
        let e = self.open(fd)?;
        Ok(self
            .stack
            .local_addr(e.conn)
            .unwrap_or_else(|| SocketAddr::new(unspecified(e.family), 0)))
    }

    pub fn getpeername(&self, fd: Handle) -> Result<SocketAddr> {
        let e = self.open(fd)?;
        let mut s = e.inner.lock();
        self.refresh(&e, &mut s);
        if e.kind == ConnKind::Stream && s.state != SocketState::Connected {
            return Err(ZtsError::NotConnected);
        }
        self.stack.peer_addr(e.conn).ok_or(ZtsError::NotConnected)
    }

    pub fn state(&self, fd: Handle) -> Result<SocketState> {
        let e = self.open(fd)?;
        let mut s = e.inner.lock();
        self.refresh(&e, &mut s);
        Ok(s.state)
    }

    fn readiness(&self, e: &SocketEntry) -> Readiness {
        let mut s = e.inner.lock();
        self.refresh(e, &mut s);
        match s.state {
            SocketState::Created | SocketState::Bound if e.kind == ConnKind::Stream => Readiness::default(),
            _ => self.stack.readiness(e.conn),
        }
    }

    /// Wait until a watched handle below `nfds` is ready or `timeout`
    /// elapses (`None` waits indefinitely). The sets are rewritten to the
    /// ready subsets; the result is the total number of ready bits.
    pub fn select(
        &self,
        nfds: i32,
        mut read: Option<&mut FdSet>,
        mut write: Option<&mut FdSet>,
        mut except: Option<&mut FdSet>,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        self.gate.check()?;
        let mut watched: BTreeSet<Handle> = BTreeSet::new();
        for set in [read.as_deref(), write.as_deref(), except.as_deref()].into_iter().flatten() {
            watched.extend(set.iter().filter(|fd| *fd < nfds));
        }
        let entries: Vec<(Handle, Arc<SocketEntry>)> = watched
            .into_iter()
            .map(|fd| self.entry(fd).map(|e| (fd, e)))
            .collect::<Result<_>>()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let epoch = self.ready.current();
            let mut r = FdSet::new();
            let mut w = FdSet::new();
            let mut x = FdSet::new();
            for (fd, e) in &entries {
                let ready = self.readiness(e);
                if ready.readable && read.as_deref().is_some_and(|s| s.contains(*fd)) {
                    r.insert(*fd);
                }
                if ready.writable && write.as_deref().is_some_and(|s| s.contains(*fd)) {
                    w.insert(*fd);
                }
                if ready.error && except.as_deref().is_some_and(|s| s.contains(*fd)) {
                    x.insert(*fd);
                }
            }
            let count = r.len() + w.len() + x.len();
            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            if count > 0 || expired {
                if let Some(s) = read.as_deref_mut() {
                    *s = r;
                }
                if let Some(s) = write.as_deref_mut() {
                    *s = w;
                }
                if let Some(s) = except.as_deref_mut() {
                    *s = x;
                }
                return Ok(count);
            }
            self.ready.wait(epoch, deadline);
            self.gate.check()?;
        }
    }

    /// Live handles.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .entries
            .iter()
            .filter(|s| matches!(s, Slot::Live { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Driver: readiness of `conn` may have changed.
    pub(crate) fn notify(&self, conn: ConnId) {
        let Some((idx, generation)) = self.by_conn.lock().get(&conn).copied() else {
            return;
        };
        let entry = match self.slots.read().entries.get(idx) {
            Some(Slot::Live { generation: g, entry }) if *g == generation => Some(entry.clone()),
            _ => None,
        };
        if let Some(e) = entry {
            let _s = e.inner.lock();
            e.cv.notify_all();
        }
        self.ready.bump();
    }

    /// Driver: the stack finished tearing `conn` down.
    pub(crate) fn release(&self, conn: ConnId) {
        let Some((idx, generation)) = self.by_conn.lock().remove(&conn) else {
            return;
        };
        let orphan = {
            let mut slots = self.slots.write();
            let draining = matches!(
                slots.entries.get(idx),
                Some(Slot::Draining { generation: g }) if *g == generation
            );
            if draining {
                slots.entries[idx] = Slot::Vacant {
                    generation: generation.wrapping_add(1),
                };
                slots.free.push_back(idx);
                trace!(fd = idx, conn = conn.0, "socket slot recycled");
                None
            } else {
                match slots.entries.get(idx) {
                    Some(Slot::Live { generation: g, entry }) if *g == generation => Some(entry.clone()),
                    _ => None,
                }
            }
        };
        if let Some(e) = orphan {
            let mut s = e.inner.lock();
            s.released = true;
            s.state = SocketState::Closing;
            e.cv.notify_all();
        }
        self.ready.bump();
    }

    fn live(&self) -> Vec<Arc<SocketEntry>> {
        self.slots
            .read()
            .entries
            .iter()
            .filter_map(|s| match s {
                Slot::Live { entry, .. } => Some(entry.clone()),
                _ => None,
            })
            .collect()
    }

    /// Wake every blocked call so it re-checks the service state.
    pub(crate) fn wake_all(&self) {
        for e in self.live() {
            let _s = e.inner.lock();
            e.cv.notify_all();
        }
        self.ready.bump();
    }

    /// Close every socket at once and forget all slots. Used by `free`.
    pub(crate) fn close_all(&self) {
        let live = {
            let mut slots = self.slots.write();
            slots.free.clear();
            std::mem::take(&mut slots.entries)
        };
        let mut closed = 0usize;
        for slot in live {
            if let Slot::Live { entry, .. } = slot {
                {
                    let mut s = entry.inner.lock();
                    s.closed = true;
                    s.state = SocketState::Closed;
                    entry.cv.notify_all();
                }
                self.stack.close(entry.conn, true);
                closed += 1;
            }
        }
        self.by_conn.lock().clear();
        self.ready.bump();
        debug!(closed, "all sockets closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AddressRecord, NetworkId, AF_INET, AF_INET6, SOCK_RAW};
    use crate::options::{SOL_SOCKET, SO_ERROR, SO_LINGER, SO_RCVTIMEO, SO_TYPE, TCP_NODELAY};
    use crate::service::ServiceState;
    use crate::stack::StackEvent;
    use crate::vstack::{StackConfig, VirtualStack};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::JoinHandle;

    const NWID: NetworkId = NetworkId(0x8056_c2e2_1c00_0001);

    struct Harness {
        table: Arc<SocketTable>,
        gate: Arc<Gate>,
        stop: Arc<AtomicBool>,
        driver: Option<JoinHandle<()>>,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(d) = self.driver.take() {
                d.join().unwrap();
            }
        }
    }

    /// One stack on 10.0.0.1/24 talking to itself, pumped by a test driver.
    fn harness(cfg: ServiceConfig) -> Harness {
        let stack = Arc::new(VirtualStack::new(StackConfig::from(&cfg), "test"));
        stack.add_address(NWID, AddressRecord::new("10.0.0.1".parse().unwrap(), 24), 2800);
        let gate = Arc::new(Gate::new(ServiceState::Running));
        let table = Arc::new(SocketTable::new(stack.clone(), gate.clone(), Arc::new(|| {}), &cfg));
        let stop = Arc::new(AtomicBool::new(false));
        let driver = {
            let (table, stop) = (table.clone(), stop.clone());
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let poll = stack.poll(Instant::now());
                    for (nwid, dst, frame) in poll.outbound {
                        if stack.is_local(&dst) {
                            stack.ingest(nwid, &frame);
                        } else {
                            stack.unreachable(nwid, dst);
                        }
                    }
                    for ev in poll.events {
                        match ev {
                            StackEvent::Changed(c) => table.notify(c),
                            StackEvent::Released(c) => table.release(c),
                        }
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };
        Harness {
            table,
            gate,
            stop,
            driver: Some(driver),
        }
    }

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn tcp(t: &SocketTable) -> Handle {
        t.socket(AF_INET, SOCK_STREAM, 0).unwrap()
    }

    fn listener(t: &SocketTable, port: u16, backlog: i32) -> Handle {
        let fd = tcp(t);
        t.bind(fd, SocketAddr::new("10.0.0.1".parse().unwrap(), port)).unwrap();
        t.listen(fd, backlog).unwrap();
        fd
    }

    fn pair(t: &SocketTable, port: u16) -> (Handle, Handle, Handle) {
        let l = listener(t, port, 4);
        let c = tcp(t);
        t.connect(c, SocketAddr::new("10.0.0.1".parse().unwrap(), port)).unwrap();
        let (a, _) = t.accept(l).unwrap();
        (l, c, a)
    }

    fn eventually(mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn unsupported_socket_kinds() {
        let h = harness(ServiceConfig::default());
        let t = &h.table;
        assert!(t.socket(AF_INET, SOCK_RAW, 0).is_err());
        assert!(t.socket(AF_INET, SOCK_STREAM, IPPROTO_UDP).is_err());
        assert!(t.socket(99, SOCK_STREAM, 0).is_err());
        assert!(t.socket(AF_INET6, SOCK_DGRAM, IPPROTO_UDP).is_ok());
    }

    #[test]
    fn handles_recycle_only_after_release_in_fifo_order() {
        let h = harness(ServiceConfig {
            max_sockets: 3,
            ..ServiceConfig::default()
        });
        let t = &h.table;
        assert_eq!((tcp(t), tcp(t), tcp(t)), (0, 1, 2));
        t.close(1).unwrap();
        t.close(0).unwrap();
        let next = || {
            let mut fd = None;
            eventually(|| {
                fd = t.socket(AF_INET, SOCK_STREAM, 0).ok();
                fd.is_some()
            });
            fd
        };
        assert_eq!(next(), Some(1));
        assert_eq!(next(), Some(0));
        assert_eq!(
            t.socket(AF_INET, SOCK_STREAM, 0),
            Err(ZtsError::InvalidOperation("socket table full"))
        );
    }

    #[test]
    fn double_close_is_invalid() {
        let h = harness(ServiceConfig::default());
        let fd = tcp(&h.table);
        assert_eq!(h.table.close(fd), Ok(()));
        assert_eq!(
            h.table.close(fd),
            Err(ZtsError::InvalidArgument("unknown socket"))
        );
    }

    #[test]
    fn blocking_connect_accept_and_transfer() {
        let h = harness(ServiceConfig::default());
        let t = &h.table;
        let (l, c, a) = pair(t, 7000);
        assert_eq!(t.state(c).unwrap(), SocketState::Connected);
        assert_eq!(t.getpeername(c).unwrap(), sa("10.0.0.1:7000"));
        assert_eq!(t.getsockopt(l, SOL_SOCKET, crate::options::SO_ACCEPTCONN).unwrap(), OptionValue::Int(1));
        assert_eq!(t.send(c, b"hello", 0).unwrap(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(t.recv(a, &mut buf, MSG_PEEK).unwrap(), 5);
        assert_eq!(t.recv(a, &mut buf, 0).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(t.recv(a, &mut buf, MSG_DONTWAIT), Err(ZtsError::WouldBlock));
        t.shutdown(c, SHUT_WR).unwrap();
        assert_eq!(t.recv(a, &mut buf, 0).unwrap(), 0);
        assert_eq!(t.send(c, b"x", 0), Err(ZtsError::BrokenPipe));
    }

    #[test]
    fn nonblocking_connect_reports_through_select_and_so_error() {
        let h = harness(ServiceConfig::default());
        let t = &h.table;
        let fd = tcp(t);
        t.fcntl(fd, F_SETFL, O_NONBLOCK).unwrap();
        assert_eq!(t.fcntl(fd, F_GETFL, 0).unwrap(), O_NONBLOCK);
        assert_eq!(t.connect(fd, sa("10.0.0.1:7999")), Err(ZtsError::InProgress));
        let mut w: FdSet = [fd].into_iter().collect();
        let n = t.select(fd + 1, None, Some(&mut w), None, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(n, 1);
        assert!(w.contains(fd));
        assert_eq!(
            t.getsockopt(fd, SOL_SOCKET, SO_ERROR).unwrap(),
            OptionValue::Int(crate::error::errno::ECONNREFUSED)
        );
        assert_eq!(t.getsockopt(fd, SOL_SOCKET, SO_ERROR).unwrap(), OptionValue::Int(0));
        assert_eq!(t.state(fd).unwrap(), SocketState::Closing);
    }

    #[test]
    fn blocking_connect_to_missing_listener_is_refused() {
        let h = harness(ServiceConfig::default());
        let fd = tcp(&h.table);
        assert_eq!(h.table.connect(fd, sa("10.0.0.1:7998")), Err(ZtsError::ConnectionRefused));
        assert_eq!(h.table.state(fd).unwrap(), SocketState::Closing);
    }

    #[test]
    fn connect_without_route_is_unreachable() {
        let h = harness(ServiceConfig::default());
        let fd = tcp(&h.table);
        assert_eq!(h.table.connect(fd, sa("192.168.1.1:80")), Err(ZtsError::HostUnreachable));
    }

    #[test]
    fn receive_timeout() {
        let h = harness(ServiceConfig::default());
        let t = &h.table;
        let (_, c, _) = pair(t, 7001);
        t.setsockopt(c, SOL_SOCKET, SO_RCVTIMEO, OptionValue::Duration(Duration::from_millis(30)))
            .unwrap();
        let started = Instant::now();
        let mut buf = [0u8; 4];
        assert_eq!(t.recv(c, &mut buf, 0), Err(ZtsError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let h = harness(ServiceConfig::default());
        let (_, c, _) = pair(&h.table, 7002);
        let table = h.table.clone();
        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            table.recv(c, &mut buf, 0)
        });
        std::thread::sleep(Duration::from_millis(50));
        h.table.close(c).unwrap();
        assert_eq!(reader.join().unwrap(), Err(ZtsError::Closed));
    }

    #[test]
    fn stopping_wakes_blocked_accept() {
        let h = harness(ServiceConfig::default());
        let l = listener(&h.table, 7003, 1);
        let table = h.table.clone();
        let acceptor = std::thread::spawn(move || table.accept(l).map(|_| ()));
        std::thread::sleep(Duration::from_millis(50));
        h.gate.set(ServiceState::Stopping);
        h.table.wake_all();
        assert_eq!(acceptor.join().unwrap(), Err(ZtsError::ServiceUnavailable));
        assert_eq!(h.table.socket(AF_INET, SOCK_STREAM, 0), Err(ZtsError::ServiceUnavailable));
    }

    #[test]
    fn select_rules() {
        let h = harness(ServiceConfig::default());
        let t = &h.table;
        let fd = tcp(t);
        let mut r: FdSet = [fd].into_iter().collect();
        let started = Instant::now();
        assert_eq!(t.select(fd + 1, Some(&mut r), None, None, Some(Duration::ZERO)).unwrap(), 0);
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(r.is_empty());
        let mut bad: FdSet = [42].into_iter().collect();
        assert!(t.select(43, Some(&mut bad), None, None, Some(Duration::ZERO)).is_err());
    }

    #[test]
    fn select_rewrites_each_set_to_its_ready_subset() {
        let h = harness(ServiceConfig::default());
        let t = &h.table;
        let (_, c, a) = pair(t, 7005);
        t.send(c, b"ping", 0).unwrap();
        eventually(|| t.readiness(&t.entry(a).unwrap()).readable);
        let mut r: FdSet = [a, c].into_iter().collect();
        let mut w: FdSet = [c].into_iter().collect();
        let n = {
            let mut x: FdSet = [a, c].into_iter().collect();
            let n = t
                .select(a.max(c) + 1, Some(&mut r), Some(&mut w), Some(&mut x), Some(Duration::ZERO))
                .unwrap();
            assert!(x.is_empty());
            n
        };
        assert_eq!(n, 2);
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![a]);
        assert_eq!(w.iter().collect::<Vec<_>>(), vec![c]);
    }

    #[test]
    fn flags_options_and_ioctl() {
        let h = harness(ServiceConfig::default());
        let t = &h.table;
        let (_, c, a) = pair(t, 7004);
        let mut buf = [0u8; 8];
        assert!(matches!(t.recv(a, &mut buf, MSG_OOB), Err(ZtsError::InvalidArgument(_))));
        assert!(matches!(t.send(c, b"x", MSG_WAITALL), Err(ZtsError::InvalidArgument(_))));
        assert_eq!(t.send(c, b"", 0), Ok(0));
        t.send(c, b"abc", 0).unwrap();
        let mut avail = 0;
        eventually(|| {
            t.ioctl(a, FIONREAD, &mut avail).unwrap();
            avail == 3
        });
        let mut on = 1;
        t.ioctl(a, FIONBIO, &mut on).unwrap();
        assert_eq!(t.fcntl(a, F_GETFL, 0).unwrap(), O_NONBLOCK);
        assert!(t.ioctl(a, 0x1234, &mut on).is_err());
        assert_eq!(t.getsockopt(a, SOL_SOCKET, SO_TYPE).unwrap(), OptionValue::Int(SOCK_STREAM));
        t.setsockopt(c, IPPROTO_TCP, TCP_NODELAY, OptionValue::Int(1)).unwrap();
        assert!(t.setsockopt(c, SOL_SOCKET, SO_ERROR, OptionValue::Int(0)).is_err());
        t.setsockopt(c, SOL_SOCKET, SO_LINGER, OptionValue::Linger(Some(Duration::ZERO))).unwrap();
        t.close(c).unwrap();
        let mut b = [0u8; 8];
        t.recv(a, &mut b, 0).unwrap();
        eventually(|| t.recv(a, &mut b, 0) == Err(ZtsError::ConnectionReset));
    }

    #[test]
    fn state_rules() {
        let h = harness(ServiceConfig::default());
        let t = &h.table;
        let udp = t.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
        assert!(matches!(t.listen(udp, 1), Err(ZtsError::InvalidOperation(_))));
        let fd = tcp(t);
        assert!(matches!(t.accept(fd), Err(ZtsError::InvalidOperation(_))));
        assert_eq!(t.getpeername(fd), Err(ZtsError::NotConnected));
        assert_eq!(t.getsockname(fd).unwrap(), sa("0.0.0.0:0"));
        let mut buf = [0u8; 1];
        assert_eq!(t.recv(fd, &mut buf, 0), Err(ZtsError::NotConnected));
        assert_eq!(t.shutdown(fd, SHUT_RD), Err(ZtsError::NotConnected));
        assert!(t.shutdown(fd, 7).is_err());
        t.listen(fd, 0).unwrap();
        assert!(matches!(t.connect(fd, sa("10.0.0.1:1")), Err(ZtsError::InvalidOperation(_))));
        assert!(matches!(t.bind(fd, sa("10.0.0.1:5")), Err(ZtsError::InvalidOperation(_))));
    }

    #[test]
    fn datagram_exchange() {
        let h = harness(ServiceConfig::default());
        let t = &h.table;
        let rx = t.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
        t.bind(rx, sa("10.0.0.1:5353")).unwrap();
        let tx = t.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
        assert_eq!(t.send(tx, b"ping", 0), Err(ZtsError::NotConnected));
        assert_eq!(t.sendto(tx, b"ping", 0, Some(sa("10.0.0.1:5353"))).unwrap(), 4);
        let mut small = [0u8; 2];
        let (n, from) = t.recvfrom(rx, &mut small, 0).unwrap();
        assert_eq!((n, &small), (2, b"pi"));
        assert_eq!(from.map(|f| f.ip()), Some("10.0.0.1".parse().unwrap()));
    }
}
