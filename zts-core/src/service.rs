//! Service lifecycle and the background driver.
//!
//! A [`Service`] owns one overlay node, one embedded stack, the network and
//! socket tables and an event dispatcher. Every operation other than `start`
//! is gated on the service being Running. The driver thread polls the
//! overlay, feeds frames into the stack, flushes stack output back out and
//! turns asynchronous completions into socket wake-ups and events.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::config::ServiceConfig;
use crate::error::{Result, ZtsError};
use crate::events::{EventCallback, EventDispatcher};
use crate::identity::Identity;
use crate::model::{
    AddressFamily, AddressRecord, Event, EventCode, NetworkId, NetworkRecord, NodeId, PeerRecord,
    PeerStatus,
};
use crate::network::NetworkTable;
use crate::options::OptionValue;
use crate::overlay::{OverlayCore, OverlayEvent, OverlayProvider, Waker};
use crate::socket::{FdSet, Handle, SocketState, SocketTable};
use crate::stack::{NetStack, StackEvent};
use crate::vstack::{StackConfig, VirtualStack};

/// Stack poll rounds per driver tick; loopback traffic needs several.
const MAX_FLUSH_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Uninitialized = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    Freed = 5,
}

impl ServiceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServiceState::Uninitialized,
            1 => ServiceState::Starting,
            2 => ServiceState::Running,
            3 => ServiceState::Stopping,
            4 => ServiceState::Stopped,
            _ => ServiceState::Freed,
        }
    }
}

/// Atomic lifecycle state consulted by every gated operation.
pub(crate) struct Gate {
    state: AtomicU8,
}

impl Gate {
    pub(crate) fn new(state: ServiceState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
        }
    }

    pub(crate) fn get(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.get() == ServiceState::Running {
            Ok(())
        } else {
            Err(ZtsError::ServiceUnavailable)
        }
    }
}

enum Command {
    Resume,
    Quiesce(Sender<()>),
    NetworkLeft(NetworkId),
    Shutdown,
}

/// Driver sleep with early wake-up.
#[derive(Default)]
struct DriverWaker {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl DriverWaker {
    fn wake(&self) {
        *self.pending.lock() = true;
        self.cv.notify_one();
    }

    fn sleep(&self, max: Duration) {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cv.wait_for(&mut pending, max);
        }
        *pending = false;
    }
}

#[derive(Default)]
struct Progress {
    online: bool,
    stack_up: bool,
    default_ready: bool,
    failed: Option<ZtsError>,
}

/// What `start` waits for.
#[derive(Default)]
struct Startup {
    progress: Mutex<Progress>,
    cv: Condvar,
}

impl Startup {
    fn reset(&self, needs_default: bool) {
        *self.progress.lock() = Progress {
            default_ready: !needs_default,
            ..Progress::default()
        };
    }

    fn update(&self, f: impl FnOnce(&mut Progress)) {
        let mut p = self.progress.lock();
        f(&mut p);
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut p = self.progress.lock();
        loop {
            if let Some(e) = p.failed.clone() {
                return Err(e);
            }
            if p.online && p.stack_up && p.default_ready {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ZtsError::Timeout);
            }
            self.cv.wait_until(&mut p, deadline);
        }
    }
}

struct Runtime {
    node_id: NodeId,
    home: PathBuf,
    config: ServiceConfig,
    default_network: Option<NetworkId>,
    overlay: Mutex<Box<dyn OverlayCore>>,
    stack: Arc<dyn NetStack>,
    networks: NetworkTable,
    sockets: SocketTable,
    commands: Mutex<VecDeque<Command>>,
    waker: Arc<DriverWaker>,
    events: EventDispatcher,
    startup: Startup,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    fn command(&self, command: Command) {
        self.commands.lock().push_back(command);
        self.waker.wake();
    }

    fn node_event(&self, code: EventCode) -> Event {
        Event::node(code, self.node_id)
    }

    fn run(self: Arc<Self>) {
        info!(node = %self.node_id, "driver started");
        self.events.emit(self.node_event(EventCode::NodeUp));
        self.events.emit(self.node_event(EventCode::NetworkStackUp));
        self.startup.update(|p| p.stack_up = true);
        let tick = self.config.tick_interval();
        loop {
            let mut out = Vec::new();
            let mut acks = Vec::new();
            let mut changes = Vec::new();
            let exit = self.tick(&mut out, &mut acks, &mut changes);
            for change in changes {
                match change {
                    StackEvent::Changed(conn) => self.sockets.notify(conn),
                    StackEvent::Released(conn) => self.sockets.release(conn),
                }
            }
            self.events.emit_all(out);
            for ack in acks {
                let _ = ack.send(());
            }
            if exit {
                break;
            }
            self.waker.sleep(tick);
        }
        info!(node = %self.node_id, "driver stopped");
    }

    /// One pass with the overlay locked. True once the driver must exit.
    fn tick(&self, out: &mut Vec<Event>, acks: &mut Vec<Sender<()>>, changes: &mut Vec<StackEvent>) -> bool {
        let mut overlay = self.overlay.lock();
        let commands: Vec<Command> = self.commands.lock().drain(..).collect();
        for command in commands {
            match command {
                Command::Resume => self.resume(&mut **overlay, out),
                Command::Quiesce(ack) => {
                    self.quiesce(&mut **overlay, out, changes);
                    acks.push(ack);
                }
                Command::NetworkLeft(nwid) => {
                    self.stack.remove_network(nwid);
                    out.push(Event::network(EventCode::NetifRemoved, nwid));
                    out.push(Event::network(EventCode::NetworkDown, nwid));
                }
                Command::Shutdown => {
                    overlay.shutdown();
                    out.push(self.node_event(EventCode::NodeDown));
                    out.push(self.node_event(EventCode::NodeNormalTermination));
                    return true;
                }
            }
        }
        for ev in overlay.poll_events() {
            self.apply(ev, out);
        }
        self.pump(&mut **overlay, changes, MAX_FLUSH_ROUNDS);
        false
    }

    fn apply(&self, ev: OverlayEvent, out: &mut Vec<Event>) {
        match ev {
            OverlayEvent::Frame { nwid, data } => self.stack.ingest(nwid, &data),
            OverlayEvent::Unreachable { nwid, dst } => self.stack.unreachable(nwid, dst),
            OverlayEvent::NodeOnline => {
                out.push(self.node_event(EventCode::NodeOnline));
                self.startup.update(|p| p.online = true);
            }
            OverlayEvent::NodeOffline => {
                out.push(self.node_event(EventCode::NodeOffline));
                self.startup.update(|p| p.online = false);
            }
            OverlayEvent::IdentityCollision => {
                error!(node = %self.node_id, "node id is claimed by another identity");
                out.push(self.node_event(EventCode::NodeIdentityCollision));
                self.startup.update(|p| {
                    p.failed = Some(ZtsError::Identity("node id collision".into()))
                });
            }
            OverlayEvent::Fatal(reason) => {
                error!(node = %self.node_id, %reason, "overlay core failed");
                out.push(self.node_event(EventCode::NodeUnrecoverableError));
                self.startup.update(|p| p.failed = Some(ZtsError::ServiceUnavailable));
            }
            OverlayEvent::NetworkStatus { nwid, status } => {
                out.extend(
                    self.networks
                        .apply_status(nwid, status)
                        .into_iter()
                        .map(|code| Event::network(code, nwid)),
                );
                self.check_default(nwid);
            }
            OverlayEvent::NetworkConfig { nwid, config } => {
                let Some(delta) = self.networks.apply_config(nwid, config) else {
                    trace!(network = %nwid, "config for a network no longer joined");
                    return;
                };
                for a in &delta.removed {
                    self.stack.remove_address(nwid, a.ip);
                }
                if let Some(record) = self.networks.details(nwid) {
                    for a in &record.addresses {
                        self.stack.add_address(nwid, *a, delta.mtu);
                    }
                }
                self.stack.set_routes(nwid, &delta.routes);
                out.extend(delta.events.iter().map(|code| Event::network(*code, nwid)));
                self.check_default(nwid);
            }
            OverlayEvent::Peer { node, status } => {
                debug!(peer = %node, ?status, "peer status");
                out.push(Event::node(status.event_code(), node));
            }
        }
    }

    fn check_default(&self, nwid: NetworkId) {
        if self.default_network == Some(nwid) && self.networks.is_ready(nwid) {
            self.startup.update(|p| p.default_ready = true);
        }
    }

    /// Flush stack output to the overlay. Frames for one of our own
    /// addresses loop straight back into the stack.
    fn pump(&self, overlay: &mut dyn OverlayCore, changes: &mut Vec<StackEvent>, rounds: usize) {
        for _ in 0..rounds {
            let poll = self.stack.poll(Instant::now());
            let idle = poll.outbound.is_empty();
            changes.extend(poll.events);
            for (nwid, dst, frame) in poll.outbound {
                if self.stack.is_local(&dst) {
                    self.stack.ingest(nwid, &frame);
                } else if let Err(e) = overlay.send_frame(nwid, dst, frame) {
                    trace!(network = %nwid, %dst, error = %e, "frame not sent");
                }
            }
            if idle {
                break;
            }
        }
    }

    fn quiesce(&self, overlay: &mut dyn OverlayCore, out: &mut Vec<Event>, changes: &mut Vec<StackEvent>) {
        self.pump(overlay, changes, 1);
        for nwid in self.networks.ids() {
            self.stack.remove_network(nwid);
        }
        overlay.go_offline();
        self.startup.update(|p| p.stack_up = false);
        out.push(self.node_event(EventCode::NetworkStackDown));
        debug!(node = %self.node_id, "driver quiesced");
    }

    fn resume(&self, overlay: &mut dyn OverlayCore, out: &mut Vec<Event>) {
        for record in self.networks.all() {
            for a in &record.addresses {
                self.stack.add_address(record.id, *a, record.mtu);
            }
            self.stack.set_routes(record.id, &record.routes);
        }
        out.push(self.node_event(EventCode::NetworkStackUp));
        self.startup.update(|p| p.stack_up = true);
        if let Some(nwid) = self.default_network {
            self.check_default(nwid);
        }
        if let Err(e) = overlay.go_online() {
            warn!(node = %self.node_id, error = %e, "node could not go online");
            self.startup.update(|p| p.failed = Some(e));
        }
        debug!(node = %self.node_id, "driver resumed");
    }

    /// Ask the driver to quiesce and wait for it.
    fn quiesce_and_wait(&self) {
        let (tx, rx) = mpsc::channel();
        self.command(Command::Quiesce(tx));
        if rx.recv_timeout(self.config.startup_timeout()).is_err() {
            warn!(node = %self.node_id, "driver did not acknowledge quiesce");
        }
    }

    /// Stop the driver for good and drain the event queue.
    fn shutdown(&self) {
        self.command(Command::Shutdown);
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if driver.join().is_err() {
                error!(node = %self.node_id, "driver thread panicked");
            }
        }
        self.events.shutdown();
    }
}

/// One virtual-network node with its socket layer.
pub struct Service {
    gate: Arc<Gate>,
    transition: Mutex<()>,
    provider: Arc<dyn OverlayProvider>,
    base: ServiceConfig,
    socket_limit: Option<usize>,
    runtime: RwLock<Option<Arc<Runtime>>>,
}

impl Service {
    pub fn new(provider: Arc<dyn OverlayProvider>) -> Self {
        Self::with_config(provider, ServiceConfig::default())
    }

    /// `config` is the base that `<home>/zts.toml` and the environment
    /// refine at first start.
    pub fn with_config(provider: Arc<dyn OverlayProvider>, config: ServiceConfig) -> Self {
        Self {
            gate: Arc::new(Gate::new(ServiceState::Uninitialized)),
            transition: Mutex::new(()),
            provider,
            base: config,
            socket_limit: None,
            runtime: RwLock::new(None),
        }
    }

    /// Hard ceiling on `max_sockets`, applied after the config file and
    /// environment. Handles then stay below `limit`.
    pub fn with_socket_limit(mut self, limit: usize) -> Self {
        self.socket_limit = Some(limit.max(1));
        self
    }

    pub fn state(&self) -> ServiceState {
        self.gate.get()
    }

    pub fn is_running(&self) -> bool {
        self.gate.get() == ServiceState::Running
    }

    /// Whether the overlay node is online. Ungated.
    pub fn node_online(&self) -> bool {
        self.runtime
            .read()
            .as_ref()
            .is_some_and(|rt| rt.startup.progress.lock().online)
    }

    /// Running, with the node online and the stack up.
    pub fn is_ready(&self) -> bool {
        self.is_running()
            && self.runtime.read().as_ref().is_some_and(|rt| {
                let p = rt.startup.progress.lock();
                p.online && p.stack_up
            })
    }

    fn runtime(&self) -> Result<Arc<Runtime>> {
        self.gate.check()?;
        self.runtime.read().clone().ok_or(ZtsError::ServiceUnavailable)
    }

    /// Start the node and block until it is online, its stack is up and the
    /// configured default network (if any) is ready. From Stopped the
    /// existing node resumes and `home`, `callback` and `port` are ignored.
    pub fn start(&self, home: impl AsRef<Path>, callback: Option<EventCallback>, port: u16) -> Result<()> {
        let _transition = self.transition.lock();
        let from = self.gate.get();
        if !matches!(from, ServiceState::Uninitialized | ServiceState::Stopped) {
            return Err(ZtsError::InvalidOperation("service cannot start from this state"));
        }
        self.gate.set(ServiceState::Starting);
        info!(?from, "service starting");
        let existing = self.runtime.read().clone();
        let result = match existing {
            Some(rt) => Self::resume(&rt),
            None => self.boot(home.as_ref(), callback, port),
        };
        match result {
            Ok(()) => {
                self.gate.set(ServiceState::Running);
                info!("service running");
                Ok(())
            }
            Err(e) => {
                self.gate.set(ServiceState::Stopped);
                warn!(error = %e, "service start failed");
                Err(e)
            }
        }
    }

    fn resume(rt: &Runtime) -> Result<()> {
        rt.startup.reset(rt.default_network.is_some());
        rt.command(Command::Resume);
        let result = rt.startup.wait(rt.config.startup_timeout());
        if result.is_err() {
            rt.quiesce_and_wait();
        }
        result
    }

    fn boot(&self, home: &Path, callback: Option<EventCallback>, port: u16) -> Result<()> {
        std::fs::create_dir_all(home)
            .map_err(|e| ZtsError::Config(format!("{}: {e}", home.display())))?;
        let mut config = ServiceConfig::load(self.base.clone(), home)?;
        if let Some(limit) = self.socket_limit.filter(|l| config.max_sockets > *l) {
            warn!(configured = config.max_sockets, limit, "max_sockets clamped");
            config.max_sockets = limit;
        }
        let default_network = config.default_network_id()?;
        let (identity, fresh) = Identity::load_or_generate(home)?;
        let node_id = identity.node_id();
        info!(node = %node_id, fresh, home = %home.display(), port, "identity ready");

        let waker = Arc::new(DriverWaker::default());
        let kick: Waker = {
            let waker = waker.clone();
            Arc::new(move || waker.wake())
        };
        let overlay = self.provider.open(identity, port, kick.clone())?;
        let stack: Arc<dyn NetStack> = Arc::new(VirtualStack::new(
            StackConfig::from(&config),
            &node_id.to_string(),
        ));
        let events = EventDispatcher::new(callback, config.event_queue_capacity).map_err(|e| {
            error!(error = %e, "event thread spawn failed");
            ZtsError::ServiceUnavailable
        })?;
        let rt = Arc::new(Runtime {
            node_id,
            home: home.to_path_buf(),
            sockets: SocketTable::new(stack.clone(), self.gate.clone(), kick, &config),
            config,
            default_network,
            overlay: Mutex::new(overlay),
            stack,
            networks: NetworkTable::new(),
            commands: Mutex::new(VecDeque::new()),
            waker,
            events,
            startup: Startup::default(),
            driver: Mutex::new(None),
        });
        rt.startup.reset(default_network.is_some());

        let driver = {
            let rt = rt.clone();
            std::thread::Builder::new()
                .name(format!("zts-driver-{node_id}"))
                .spawn(move || rt.run())
        };
        match driver {
            Ok(handle) => *rt.driver.lock() = Some(handle),
            Err(e) => {
                error!(error = %e, "driver thread spawn failed");
                rt.events.shutdown();
                return Err(ZtsError::ServiceUnavailable);
            }
        }

        let result = Self::bring_up(&rt);
        match result {
            Ok(()) => {
                *self.runtime.write() = Some(rt);
                Ok(())
            }
            Err(e) => {
                rt.shutdown();
                Err(e)
            }
        }
    }

    fn bring_up(rt: &Runtime) -> Result<()> {
        {
            let mut overlay = rt.overlay.lock();
            overlay.go_online()?;
            if let Some(nwid) = rt.default_network {
                rt.networks.insert(nwid);
                if let Err(e) = overlay.join(nwid) {
                    warn!(network = %nwid, error = %e, "default network join failed");
                }
            }
        }
        rt.waker.wake();
        rt.startup.wait(rt.config.startup_timeout())
    }

    /// Running → Stopped. Blocked socket calls return ServiceUnavailable.
    pub fn stop(&self) -> Result<()> {
        let _transition = self.transition.lock();
        match self.gate.get() {
            ServiceState::Stopped => return Ok(()),
            ServiceState::Running => {}
            _ => return Err(ZtsError::InvalidOperation("service is not running")),
        }
        self.gate.set(ServiceState::Stopping);
        info!("service stopping");
        let rt = self.runtime.read().clone();
        if let Some(rt) = rt {
            rt.sockets.wake_all();
            rt.quiesce_and_wait();
        }
        self.gate.set(ServiceState::Stopped);
        info!("service stopped");
        Ok(())
    }

    /// Release everything. Only valid once stopped; Freed is terminal.
    pub fn free(&self) -> Result<()> {
        let _transition = self.transition.lock();
        if self.gate.get() != ServiceState::Stopped {
            return Err(ZtsError::InvalidOperation("service must be stopped before free"));
        }
        let rt = self.runtime.write().take();
        if let Some(rt) = rt {
            rt.sockets.close_all();
            let left = rt.networks.clear();
            debug!(networks = left.len(), "network records cleared");
            rt.shutdown();
        }
        self.gate.set(ServiceState::Freed);
        info!("service freed");
        Ok(())
    }

    // Node and peers.

    pub fn node_id(&self) -> Result<NodeId> {
        Ok(self.runtime()?.node_id)
    }

    pub fn home_path(&self) -> Result<PathBuf> {
        Ok(self.runtime()?.home.clone())
    }

    pub fn peers(&self) -> Result<Vec<PeerRecord>> {
        Ok(self.runtime()?.overlay.lock().peers())
    }

    pub fn peer_count(&self) -> Result<usize> {
        self.peers().map(|p| p.len())
    }

    pub fn peer_status(&self, node: NodeId) -> Result<PeerStatus> {
        self.runtime()?.overlay.lock().peer_status(node)
    }

    // Networks.

    /// Request membership. Returns at once; progress arrives as events.
    /// Joining an already joined network is a no-op.
    pub fn join(&self, nwid: NetworkId) -> Result<()> {
        let rt = self.runtime()?;
        if !rt.networks.insert(nwid) {
            debug!(network = %nwid, "already joined");
            return Ok(());
        }
        let joined = rt.overlay.lock().join(nwid);
        if let Err(e) = joined {
            rt.networks.remove(nwid);
            return Err(e);
        }
        info!(network = %nwid, "joining network");
        Ok(())
    }

    pub fn leave(&self, nwid: NetworkId) -> Result<()> {
        let rt = self.runtime()?;
        if !rt.networks.contains(nwid) {
            return Err(ZtsError::InvalidArgument("network not joined"));
        }
        rt.overlay.lock().leave(nwid)?;
        if rt.networks.remove(nwid).is_none() {
            return Err(ZtsError::InvalidArgument("network not joined"));
        }
        rt.command(Command::NetworkLeft(nwid));
        info!(network = %nwid, "left network");
        Ok(())
    }

    /// Leave every joined network; reports the first failure after trying
    /// them all.
    pub fn leave_all(&self) -> Result<()> {
        let rt = self.runtime()?;
        let mut first = None;
        for nwid in rt.networks.ids() {
            if let Err(e) = self.leave(nwid) {
                warn!(network = %nwid, error = %e, "leave failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub fn network_details(&self, nwid: NetworkId) -> Result<NetworkRecord> {
        self.runtime()?
            .networks
            .details(nwid)
            .ok_or(ZtsError::InvalidArgument("network not joined"))
    }

    pub fn all_network_details(&self) -> Result<Vec<NetworkRecord>> {
        Ok(self.runtime()?.networks.all())
    }

    pub fn num_joined_networks(&self) -> Result<usize> {
        Ok(self.runtime()?.networks.len())
    }

    /// First assigned address of `family`, in assignment order.
    pub fn get_address(&self, nwid: NetworkId, family: AddressFamily) -> Result<IpAddr> {
        self.runtime()?.networks.address(nwid, family)
    }

    pub fn has_address(&self, nwid: NetworkId) -> Result<bool> {
        self.runtime()?.networks.has_address(nwid)
    }

    pub fn num_assigned_addresses(&self, nwid: NetworkId) -> Result<usize> {
        self.runtime()?.networks.num_addresses(nwid)
    }

    pub fn address_at_index(&self, nwid: NetworkId, index: usize) -> Result<AddressRecord> {
        self.runtime()?.networks.address_at(nwid, index)
    }

    pub fn orbit(&self, world: u64, seed: u64) -> Result<()> {
        self.runtime()?.overlay.lock().orbit(world, seed)
    }

    pub fn deorbit(&self, world: u64) -> Result<()> {
        self.runtime()?.overlay.lock().deorbit(world)
    }

    // DNS and hostname.

    pub fn add_dns_nameserver(&self, addr: IpAddr) -> Result<()> {
        self.runtime()?.stack.add_dns_nameserver(addr)
    }

    pub fn del_dns_nameserver(&self, addr: IpAddr) -> Result<()> {
        self.runtime()?.stack.del_dns_nameserver(addr)
    }

    pub fn dns_nameservers(&self) -> Result<Vec<IpAddr>> {
        Ok(self.runtime()?.stack.dns_nameservers())
    }

    pub fn hostname(&self) -> Result<String> {
        Ok(self.runtime()?.stack.hostname())
    }

    pub fn set_hostname(&self, name: &str) -> Result<()> {
        self.runtime()?.stack.set_hostname(name)
    }

    // Sockets.

    pub fn socket(&self, family: i32, ty: i32, protocol: i32) -> Result<Handle> {
        self.runtime()?.sockets.socket(family, ty, protocol)
    }

    pub fn bind(&self, fd: Handle, addr: SocketAddr) -> Result<()> {
        self.runtime()?.sockets.bind(fd, addr)
    }

    pub fn listen(&self, fd: Handle, backlog: i32) -> Result<()> {
        self.runtime()?.sockets.listen(fd, backlog)
    }

    pub fn connect(&self, fd: Handle, addr: SocketAddr) -> Result<()> {
        self.runtime()?.sockets.connect(fd, addr)
    }

    pub fn accept(&self, fd: Handle) -> Result<(Handle, SocketAddr)> {
        self.runtime()?.sockets.accept(fd)
    }

    pub fn accept4(&self, fd: Handle, nonblocking: bool) -> Result<(Handle, SocketAddr)> {
        self.runtime()?.sockets.accept4(fd, nonblocking)
    }

    pub fn send(&self, fd: Handle, data: &[u8], flags: i32) -> Result<usize> {
        self.runtime()?.sockets.send(fd, data, flags)
    }

    pub fn sendto(&self, fd: Handle, data: &[u8], flags: i32, dst: SocketAddr) -> Result<usize> {
        self.runtime()?.sockets.sendto(fd, data, flags, Some(dst))
    }

    pub fn sendmsg(&self, fd: Handle, bufs: &[&[u8]], flags: i32, dst: Option<SocketAddr>) -> Result<usize> {
        self.runtime()?.sockets.sendmsg(fd, bufs, flags, dst)
    }

    pub fn write(&self, fd: Handle, data: &[u8]) -> Result<usize> {
        self.runtime()?.sockets.write(fd, data)
    }

    pub fn recv(&self, fd: Handle, buf: &mut [u8], flags: i32) -> Result<usize> {
        self.runtime()?.sockets.recv(fd, buf, flags)
    }

    pub fn recvfrom(&self, fd: Handle, buf: &mut [u8], flags: i32) -> Result<(usize, Option<SocketAddr>)> {
        self.runtime()?.sockets.recvfrom(fd, buf, flags)
    }

    pub fn recvmsg(&self, fd: Handle, bufs: &mut [&mut [u8]], flags: i32) -> Result<(usize, Option<SocketAddr>)> {
        self.runtime()?.sockets.recvmsg(fd, bufs, flags)
    }

    pub fn read(&self, fd: Handle, buf: &mut [u8]) -> Result<usize> {
        self.runtime()?.sockets.read(fd, buf)
    }

    pub fn shutdown(&self, fd: Handle, how: i32) -> Result<()> {
        self.runtime()?.sockets.shutdown(fd, how)
    }

    pub fn close(&self, fd: Handle) -> Result<()> {
        self.runtime()?.sockets.close(fd)
    }

    pub fn setsockopt(&self, fd: Handle, level: i32, name: i32, value: OptionValue) -> Result<()> {
        self.runtime()?.sockets.setsockopt(fd, level, name, value)
    }

    pub fn getsockopt(&self, fd: Handle, level: i32, name: i32) -> Result<OptionValue> {
        self.runtime()?.sockets.getsockopt(fd, level, name)
    }

    pub fn fcntl(&self, fd: Handle, cmd: i32, flags: i32) -> Result<i32> {
        self.runtime()?.sockets.fcntl(fd, cmd, flags)
    }

    pub fn ioctl(&self, fd: Handle, request: u64, arg: &mut i32) -> Result<()> {
        self.runtime()?.sockets.ioctl(fd, request, arg)
    }

    pub fn getsockname(&self, fd: Handle) -> Result<SocketAddr> {
        self.runtime()?.sockets.getsockname(fd)
    }

    pub fn getpeername(&self, fd: Handle) -> Result<SocketAddr> {
        self.runtime()?.sockets.getpeername(fd)
    }

    pub fn socket_state(&self, fd: Handle) -> Result<SocketState> {
        self.runtime()?.sockets.state(fd)
    }

    pub fn select(
        &self,
        nfds: i32,
        read: Option<&mut FdSet>,
        write: Option<&mut FdSet>,
        except: Option<&mut FdSet>,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        self.runtime()?.sockets.select(nfds, read, write, except, timeout)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if let Some(rt) = self.runtime.get_mut().take() {
            self.gate.set(ServiceState::Freed);
            rt.sockets.wake_all();
            rt.sockets.close_all();
            rt.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{Fabric, NetworkTemplate};
    use crate::model::{AF_INET, SOCK_STREAM};
    use std::net::Ipv4Addr;

    const NWID: NetworkId = NetworkId(0x8056_c2e2_1c00_0001);

    fn fabric() -> Fabric {
        let f = Fabric::new();
        f.define_network(NWID, NetworkTemplate::ipv4("lab", Ipv4Addr::new(10, 147, 17, 0), 24));
        f
    }

    fn quick() -> ServiceConfig {
        ServiceConfig {
            startup_timeout_ms: 5_000,
            tick_interval_ms: 2,
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn gate_only_opens_when_running() {
        let g = Gate::new(ServiceState::Uninitialized);
        assert_eq!(g.check(), Err(ZtsError::ServiceUnavailable));
        for s in [
            ServiceState::Starting,
            ServiceState::Stopping,
            ServiceState::Stopped,
            ServiceState::Freed,
        ] {
            g.set(s);
            assert_eq!(g.get(), s);
            assert!(g.check().is_err());
        }
        g.set(ServiceState::Running);
        assert!(g.check().is_ok());
    }

    #[test]
    fn operations_are_gated_before_start() {
        let svc = Service::new(Arc::new(fabric()));
        assert_eq!(svc.state(), ServiceState::Uninitialized);
        assert!(!svc.is_running());
        assert!(!svc.node_online());
        assert!(!svc.is_ready());
        assert_eq!(svc.join(NWID), Err(ZtsError::ServiceUnavailable));
        assert_eq!(svc.socket(AF_INET, SOCK_STREAM, 0), Err(ZtsError::ServiceUnavailable));
        assert_eq!(svc.node_id(), Err(ZtsError::ServiceUnavailable));
        assert!(matches!(svc.stop(), Err(ZtsError::InvalidOperation(_))));
        assert!(matches!(svc.free(), Err(ZtsError::InvalidOperation(_))));
    }

    #[test]
    fn start_stop_restart_free() {
        let dir = tempfile::tempdir().unwrap();
        let svc = Service::with_config(Arc::new(fabric()), quick());
        svc.start(dir.path(), None, 9994).unwrap();
        assert!(svc.is_running());
        assert!(matches!(
            svc.start(dir.path(), None, 9994),
            Err(ZtsError::InvalidOperation(_))
        ));
        assert!(svc.node_online());
        assert!(svc.is_ready());
        let id = svc.node_id().unwrap();
        assert_eq!(svc.hostname().unwrap(), id.to_string());
        assert_eq!(svc.home_path().unwrap(), dir.path());

        svc.stop().unwrap();
        assert_eq!(svc.state(), ServiceState::Stopped);
        assert!(!svc.is_ready());
        assert_eq!(svc.stop(), Ok(()));
        assert_eq!(svc.num_joined_networks(), Err(ZtsError::ServiceUnavailable));

        svc.start(dir.path(), None, 9994).unwrap();
        assert_eq!(svc.node_id().unwrap(), id);
        assert!(matches!(svc.free(), Err(ZtsError::InvalidOperation(_))));
        svc.stop().unwrap();
        svc.free().unwrap();
        assert_eq!(svc.state(), ServiceState::Freed);
        assert!(matches!(
            svc.start(dir.path(), None, 9994),
            Err(ZtsError::InvalidOperation(_))
        ));
    }

    #[test]
    fn identity_persists_across_services() {
        let dir = tempfile::tempdir().unwrap();
        let f = fabric();
        let first = {
            let svc = Service::with_config(Arc::new(f.clone()), quick());
            svc.start(dir.path(), None, 9994).unwrap();
            let id = svc.node_id().unwrap();
            svc.stop().unwrap();
            svc.free().unwrap();
            id
        };
        let svc = Service::with_config(Arc::new(f), quick());
        svc.start(dir.path(), None, 9994).unwrap();
        assert_eq!(svc.node_id().unwrap(), first);
    }

    #[test]
    fn invalid_config_file_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(crate::config::CONFIG_FILE), "bogus = 1").unwrap();
        let svc = Service::with_config(Arc::new(fabric()), quick());
        assert!(matches!(
            svc.start(dir.path(), None, 9994),
            Err(ZtsError::Config(_))
        ));
        assert_eq!(svc.state(), ServiceState::Stopped);
    }

    #[test]
    fn socket_limit_caps_configured_capacity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(crate::config::CONFIG_FILE), "max_sockets = 4096").unwrap();
        let svc = Service::with_config(Arc::new(fabric()), quick()).with_socket_limit(2);
        svc.start(dir.path(), None, 9994).unwrap();
        assert_eq!(svc.socket(AF_INET, SOCK_STREAM, 0), Ok(0));
        assert_eq!(svc.socket(AF_INET, SOCK_STREAM, 0), Ok(1));
        assert!(matches!(
            svc.socket(AF_INET, SOCK_STREAM, 0),
            Err(ZtsError::InvalidOperation(_))
        ));
    }

    #[test]
    fn dns_and_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let svc = Service::with_config(Arc::new(fabric()), quick());
        svc.start(dir.path(), None, 9994).unwrap();
        let ns: IpAddr = "10.147.17.53".parse().unwrap();
        svc.add_dns_nameserver(ns).unwrap();
        assert_eq!(svc.dns_nameservers().unwrap(), vec![ns]);
        svc.del_dns_nameserver(ns).unwrap();
        assert!(svc.del_dns_nameserver(ns).is_err());
        svc.set_hostname("lab-node").unwrap();
        assert_eq!(svc.hostname().unwrap(), "lab-node");
        assert!(svc.set_hostname("").is_err());
    }
}
