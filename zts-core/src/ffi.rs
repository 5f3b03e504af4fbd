//! C ABI for linking zts-core as a static library from C/C++ hosts.
//!
//! The C API has no context parameter, so these entry points drive one
//! process-wide [`Service`] on a process-wide [`Fabric`]. Socket calls return
//! -1 on failure and set a thread-local errno readable with `zts_errno()`;
//! other calls return a `ZTS_ERR_*` code. Addresses use the lwIP
//! `sockaddr_in` / `sockaddr_in6` layouts.

use std::cell::Cell;
use std::ffi::{c_void, CStr};
use std::mem::size_of;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::os::raw::{c_char, c_int, c_long, c_short, c_uint, c_ulong};
use std::slice;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::address::{rfc4193_address, sixplane_address};
use crate::error::{Result, ZtsError, ZTS_ERR_OK};
use crate::events::EventCallback;
use crate::fabric::{Fabric, NetworkTemplate};
use crate::model::{
    AddressFamily, NetworkId, NetworkRecord, NodeId, PeerRecord, AF_INET, AF_INET6, MAX_ASSIGNED_ADDRESSES,
    MAX_NETWORK_ROUTES, MAX_PEER_NETWORK_PATHS, O_NONBLOCK,
};
use crate::options::{OptionValue, SockOpt};
use crate::service::Service;
use crate::socket::FdSet;

/// Largest handle representable in a [`ZtsFdSet`].
pub const ZTS_FD_SETSIZE: usize = 1024;

const SOCKET_ERROR: c_int = -1;

/// Event callback: (node or network id, event code).
pub type ZtsEventHandler = extern "C" fn(u64, c_int);

#[repr(C)]
pub struct ZtsSockaddr {
    pub sa_len: u8,
    pub sa_family: u8,
    pub sa_data: [u8; 14],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ZtsSockaddrIn {
    pub sin_len: u8,
    pub sin_family: u8,
    /// Network byte order.
    pub sin_port: u16,
    /// Network byte order.
    pub sin_addr: u32,
    pub sin_zero: [u8; 8],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ZtsSockaddrIn6 {
    pub sin6_len: u8,
    pub sin6_family: u8,
    pub sin6_port: u16,
    pub sin6_flowinfo: u32,
    pub sin6_addr: [u8; 16],
    pub sin6_scope_id: u32,
}

/// Large enough for either address family.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ZtsSockaddrStorage {
    pub s2_len: u8,
    pub ss_family: u8,
    pub s2_data1: [u8; 2],
    pub s2_data2: [u32; 3],
    pub s2_data3: [u32; 3],
}

#[repr(C)]
pub struct ZtsTimeval {
    pub tv_sec: c_long,
    pub tv_usec: c_long,
}

#[repr(C)]
pub struct ZtsLinger {
    pub l_onoff: c_int,
    pub l_linger: c_int,
}

/// lwIP `fd_set`: one bit per handle.
#[repr(C)]
pub struct ZtsFdSet {
    pub fd_bits: [u8; ZTS_FD_SETSIZE / 8],
}

#[repr(C)]
pub struct ZtsIovec {
    pub iov_base: *mut c_void,
    pub iov_len: usize,
}

#[repr(C)]
pub struct ZtsMsghdr {
    pub msg_name: *mut c_void,
    pub msg_namelen: u32,
    pub msg_iov: *mut ZtsIovec,
    pub msg_iovlen: c_int,
    pub msg_control: *mut c_void,
    pub msg_controllen: u32,
    pub msg_flags: c_int,
}

/// Route target carries the prefix length in its port field; a `via` with
/// family 0 means LAN-local.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ZtsVirtualNetworkRoute {
    pub target: ZtsSockaddrStorage,
    pub via: ZtsSockaddrStorage,
    pub flags: u16,
    pub metric: u16,
}

/// Assigned addresses carry their prefix length in the port field.
#[repr(C)]
pub struct ZtsNetworkDetails {
    pub nwid: u64,
    pub mtu: c_int,
    pub num_addresses: c_short,
    pub addr: [ZtsSockaddrStorage; MAX_ASSIGNED_ADDRESSES],
    pub num_routes: c_uint,
    pub routes: [ZtsVirtualNetworkRoute; MAX_NETWORK_ROUTES],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ZtsPhysicalPath {
    pub address: ZtsSockaddrStorage,
    pub last_send: u64,
    pub last_receive: u64,
    pub trusted_path_id: u64,
    pub expired: c_int,
    pub preferred: c_int,
}

/// Versions and latency are -1 when unknown.
#[repr(C)]
pub struct ZtsPeerDetails {
    pub address: u64,
    pub version_major: c_int,
    pub version_minor: c_int,
    pub version_rev: c_int,
    pub latency: c_int,
    pub role: c_int,
    pub path_count: c_uint,
    pub paths: [ZtsPhysicalPath; MAX_PEER_NETWORK_PATHS],
}

impl ZtsSockaddrStorage {
    const EMPTY: Self = Self {
        s2_len: 0,
        ss_family: 0,
        s2_data1: [0; 2],
        s2_data2: [0; 3],
        s2_data3: [0; 3],
    };

    fn of(sa: SocketAddr) -> Self {
        let mut out = Self::EMPTY;
        let mut len = size_of::<Self>() as u32;
        write_sockaddr(sa, &mut out as *mut Self as *mut ZtsSockaddr, &mut len);
        out
    }
}

impl ZtsNetworkDetails {
    fn fill(&mut self, rec: &NetworkRecord) {
        self.nwid = rec.id.0;
        self.mtu = c_int::try_from(rec.mtu).unwrap_or(c_int::MAX);
        self.addr = [ZtsSockaddrStorage::EMPTY; MAX_ASSIGNED_ADDRESSES];
        let addrs = rec.addresses.iter().take(MAX_ASSIGNED_ADDRESSES);
        for (slot, a) in self.addr.iter_mut().zip(addrs) {
            *slot = ZtsSockaddrStorage::of(SocketAddr::new(a.ip, u16::from(a.prefix_len)));
        }
        self.num_addresses = rec.addresses.len().min(MAX_ASSIGNED_ADDRESSES) as c_short;
        let empty = ZtsVirtualNetworkRoute {
            target: ZtsSockaddrStorage::EMPTY,
            via: ZtsSockaddrStorage::EMPTY,
            flags: 0,
            metric: 0,
        };
        self.routes = [empty; MAX_NETWORK_ROUTES];
        for (slot, r) in self.routes.iter_mut().zip(rec.routes.iter().take(MAX_NETWORK_ROUTES)) {
            *slot = ZtsVirtualNetworkRoute {
                target: ZtsSockaddrStorage::of(SocketAddr::new(r.target, u16::from(r.prefix_len))),
                via: r
                    .via
                    .map_or(ZtsSockaddrStorage::EMPTY, |ip| ZtsSockaddrStorage::of(SocketAddr::new(ip, 0))),
                flags: r.flags,
                metric: r.metric,
            };
        }
        self.num_routes = rec.routes.len().min(MAX_NETWORK_ROUTES) as c_uint;
    }
}

impl ZtsPeerDetails {
    fn fill(&mut self, peer: &PeerRecord) {
        let version = |f: fn(&(u32, u32, u32)) -> u32| {
            peer.version.as_ref().map_or(-1, |v| c_int::try_from(f(v)).unwrap_or(c_int::MAX))
        };
        self.address = peer.node_id.0;
        self.version_major = version(|v| v.0);
        self.version_minor = version(|v| v.1);
        self.version_rev = version(|v| v.2);
        self.latency = peer.latency_ms.map_or(-1, |l| c_int::try_from(l).unwrap_or(c_int::MAX));
        self.role = peer.role as c_int;
        let empty = ZtsPhysicalPath {
            address: ZtsSockaddrStorage::EMPTY,
            last_send: 0,
            last_receive: 0,
            trusted_path_id: 0,
            expired: 0,
            preferred: 0,
        };
        self.paths = [empty; MAX_PEER_NETWORK_PATHS];
        for (slot, p) in self.paths.iter_mut().zip(peer.paths.iter().take(MAX_PEER_NETWORK_PATHS)) {
            *slot = ZtsPhysicalPath {
                address: ZtsSockaddrStorage::of(p.address),
                last_send: p.last_send,
                last_receive: p.last_receive,
                trusted_path_id: p.trusted_path_id,
                expired: c_int::from(p.expired),
                preferred: c_int::from(p.preferred),
            };
        }
        self.path_count = peer.paths.len().min(MAX_PEER_NETWORK_PATHS) as c_uint;
    }
}

static FABRIC: OnceLock<Fabric> = OnceLock::new();
static SERVICE: OnceLock<Service> = OnceLock::new();

thread_local! {
    static ERRNO: Cell<c_int> = const { Cell::new(0) };
}

fn fabric() -> &'static Fabric {
    FABRIC.get_or_init(Fabric::new)
}

fn service() -> &'static Service {
    SERVICE.get_or_init(|| Service::new(Arc::new(fabric().clone())).with_socket_limit(ZTS_FD_SETSIZE))
}

/// Result code of a non-socket call.
fn code(r: Result<()>) -> c_int {
    match r {
        Ok(()) => ZTS_ERR_OK,
        Err(e) => e.code(),
    }
}

/// Count result of a non-socket call.
fn count(r: Result<usize>) -> c_int {
    match r {
        Ok(n) => c_int::try_from(n).unwrap_or(c_int::MAX),
        Err(e) => e.code(),
    }
}

/// Socket call result: the value, or -1 with errno set.
fn sock<T: Into<i64>>(r: Result<T>) -> i64 {
    match r {
        Ok(v) => {
            ERRNO.with(|e| e.set(0));
            v.into()
        }
        Err(err) => {
            ERRNO.with(|e| e.set(err.errno()));
            i64::from(SOCKET_ERROR)
        }
    }
}

fn sock_int<T: Into<i64>>(r: Result<T>) -> c_int {
    c_int::try_from(sock(r)).unwrap_or(c_int::MAX)
}

fn sock_len(r: Result<usize>) -> isize {
    sock(r.map(|n| i64::try_from(n).unwrap_or(i64::MAX))) as isize
}

/// Parse an lwIP sockaddr of `len` bytes.
fn read_sockaddr(addr: *const ZtsSockaddr, len: u32) -> Result<SocketAddr> {
    if addr.is_null() {
        return Err(ZtsError::InvalidArgument("null address"));
    }
    let family = c_int::from(unsafe { (*addr).sa_family });
    match family {
        AF_INET if len as usize >= size_of::<ZtsSockaddrIn>() => {
            let sin = unsafe { (addr as *const ZtsSockaddrIn).read_unaligned() };
            let ip = Ipv4Addr::from(sin.sin_addr.to_ne_bytes());
            Ok(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        AF_INET6 if len as usize >= size_of::<ZtsSockaddrIn6>() => {
            let sin6 = unsafe { (addr as *const ZtsSockaddrIn6).read_unaligned() };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr),
                u16::from_be(sin6.sin6_port),
                u32::from_be(sin6.sin6_flowinfo),
                sin6.sin6_scope_id,
            )))
        }
        AF_INET | AF_INET6 => Err(ZtsError::InvalidArgument("address length too short")),
        _ => Err(ZtsError::InvalidArgument("unsupported address family")),
    }
}

/// Store `sa` into a caller buffer of `*len` bytes, truncating like POSIX,
/// and set `*len` to the full size. A null `addr` is skipped.
fn write_sockaddr(sa: SocketAddr, addr: *mut ZtsSockaddr, len: *mut u32) {
    if addr.is_null() || len.is_null() {
        return;
    }
    let mut buf = [0u8; size_of::<ZtsSockaddrIn6>()];
    let size = match sa {
        SocketAddr::V4(v4) => {
            let sin = ZtsSockaddrIn {
                sin_len: size_of::<ZtsSockaddrIn>() as u8,
                sin_family: AF_INET as u8,
                sin_port: v4.port().to_be(),
                sin_addr: u32::from_ne_bytes(v4.ip().octets()),
                sin_zero: [0; 8],
            };
            unsafe { (buf.as_mut_ptr() as *mut ZtsSockaddrIn).write_unaligned(sin) };
            size_of::<ZtsSockaddrIn>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = ZtsSockaddrIn6 {
                sin6_len: size_of::<ZtsSockaddrIn6>() as u8,
                sin6_family: AF_INET6 as u8,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo().to_be(),
                sin6_addr: v6.ip().octets(),
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { (buf.as_mut_ptr() as *mut ZtsSockaddrIn6).write_unaligned(sin6) };
            size_of::<ZtsSockaddrIn6>()
        }
    };
    unsafe {
        let n = (*len as usize).min(size);
        (addr as *mut u8).copy_from_nonoverlapping(buf.as_ptr(), n);
        *len = size as u32;
    }
}

fn write_storage(ip: IpAddr, out: *mut ZtsSockaddrStorage) -> c_int {
    if out.is_null() {
        return ZtsError::InvalidArgument("null address").code();
    }
    let mut len = size_of::<ZtsSockaddrStorage>() as u32;
    write_sockaddr(SocketAddr::new(ip, 0), out as *mut ZtsSockaddr, &mut len);
    ZTS_ERR_OK
}

fn timeval_duration(tv: &ZtsTimeval) -> Result<Duration> {
    if tv.tv_sec < 0 || tv.tv_usec < 0 {
        return Err(ZtsError::InvalidArgument("negative timeout"));
    }
    Ok(Duration::from_secs(tv.tv_sec as u64) + Duration::from_micros(tv.tv_usec as u64))
}

// Service lifecycle.

/// Start the node with its identity under `path`. Blocks until online.
/// Returns ZTS_ERR_OK or an error code.
#[no_mangle]
pub extern "C" fn zts_start(path: *const c_char, callback: Option<ZtsEventHandler>, port: u16) -> c_int {
    if path.is_null() {
        return ZtsError::InvalidArgument("null path").code();
    }
    let path = match unsafe { CStr::from_ptr(path) }.to_str() {
        Ok(p) => p,
        Err(_) => return ZtsError::InvalidArgument("path is not utf-8").code(),
    };
    let callback: Option<EventCallback> =
        callback.map(|cb| Arc::new(move |ev: crate::model::Event| cb(ev.id, ev.code.code())) as EventCallback);
    code(service().start(path, callback, port))
}

#[no_mangle]
pub extern "C" fn zts_stop() -> c_int {
    code(service().stop())
}

#[no_mangle]
pub extern "C" fn zts_free() -> c_int {
    code(service().free())
}

/// 1 when the service is running, else 0.
#[no_mangle]
pub extern "C" fn zts_core_running() -> c_int {
    c_int::from(service().is_running())
}

/// Same as `zts_core_running`.
#[no_mangle]
pub extern "C" fn zts_running() -> c_int {
    zts_core_running()
}

/// 1 when the overlay node is online.
#[no_mangle]
pub extern "C" fn zts_node_online() -> c_int {
    c_int::from(service().node_online())
}

/// 1 when running with the node online and the stack up.
#[no_mangle]
pub extern "C" fn zts_ready() -> c_int {
    c_int::from(service().is_ready())
}

/// 1 when gated operations would be accepted now.
#[no_mangle]
pub extern "C" fn zts_can_perform_service_operation() -> c_int {
    c_int::from(service().is_running())
}

/// Copy the home path, NUL-terminated, into `home_path` of `*len` bytes.
/// `*len` is set to the path length; a short buffer is InvalidArgument.
#[no_mangle]
pub extern "C" fn zts_get_path(home_path: *mut c_char, len: *mut usize) -> c_int {
    if home_path.is_null() || len.is_null() {
        return ZtsError::InvalidArgument("null path buffer").code();
    }
    let path = match service().home_path() {
        Ok(p) => p,
        Err(e) => return e.code(),
    };
    let bytes = path.to_string_lossy().into_owned().into_bytes();
    unsafe {
        let avail = *len;
        *len = bytes.len();
        if avail <= bytes.len() {
            return ZtsError::InvalidArgument("path buffer too short").code();
        }
        let out = home_path as *mut u8;
        out.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        *out.add(bytes.len()) = 0;
    }
    ZTS_ERR_OK
}

// Networks.

#[no_mangle]
pub extern "C" fn zts_get_num_joined_networks() -> c_int {
    count(service().num_joined_networks())
}

#[no_mangle]
pub extern "C" fn zts_join(nwid: u64) -> c_int {
    code(service().join(NetworkId(nwid)))
}

#[no_mangle]
pub extern "C" fn zts_leave(nwid: u64) -> c_int {
    code(service().leave(NetworkId(nwid)))
}

#[no_mangle]
pub extern "C" fn zts_leave_all() -> c_int {
    code(service().leave_all())
}

#[no_mangle]
pub extern "C" fn zts_orbit(moon_world_id: u64, moon_seed: u64) -> c_int {
    code(service().orbit(moon_world_id, moon_seed))
}

#[no_mangle]
pub extern "C" fn zts_deorbit(moon_world_id: u64) -> c_int {
    code(service().deorbit(moon_world_id))
}

/// Node id, or 0 when not running.
#[no_mangle]
pub extern "C" fn zts_get_node_id() -> u64 {
    service().node_id().map_or(0, |id| id.0)
}

/// 1 when `nwid` has at least one assigned address, 0 when not, else an error code.
#[no_mangle]
pub extern "C" fn zts_has_address(nwid: u64) -> c_int {
    match service().has_address(NetworkId(nwid)) {
        Ok(b) => c_int::from(b),
        Err(e) => e.code(),
    }
}

#[no_mangle]
pub extern "C" fn zts_get_num_assigned_addresses(nwid: u64) -> c_int {
    count(service().num_assigned_addresses(NetworkId(nwid)))
}

/// Assigned address `index` on `nwid` in assignment order, port 0.
#[no_mangle]
pub extern "C" fn zts_get_address_at_index(
    nwid: u64,
    index: c_int,
    addr: *mut ZtsSockaddr,
    addrlen: *mut u32,
) -> c_int {
    if addr.is_null() || addrlen.is_null() {
        return ZtsError::InvalidArgument("null address").code();
    }
    let Ok(index) = usize::try_from(index) else {
        return ZtsError::InvalidArgument("negative index").code();
    };
    match service().address_at_index(NetworkId(nwid), index) {
        Ok(rec) => {
            write_sockaddr(SocketAddr::new(rec.ip, 0), addr, addrlen);
            ZTS_ERR_OK
        }
        Err(e) => e.code(),
    }
}

#[no_mangle]
pub extern "C" fn zts_get_network_details(nwid: u64, nd: *mut ZtsNetworkDetails) -> c_int {
    if nd.is_null() {
        return ZtsError::InvalidArgument("null details").code();
    }
    match service().network_details(NetworkId(nwid)) {
        Ok(rec) => {
            unsafe { (*nd).fill(&rec) };
            ZTS_ERR_OK
        }
        Err(e) => e.code(),
    }
}

/// Fill up to `*num` entries of `nds`; `*num` is set to the count written.
#[no_mangle]
pub extern "C" fn zts_get_all_network_details(nds: *mut ZtsNetworkDetails, num: *mut c_int) -> c_int {
    if nds.is_null() || num.is_null() {
        return ZtsError::InvalidArgument("null details").code();
    }
    let records = match service().all_network_details() {
        Ok(r) => r,
        Err(e) => return e.code(),
    };
    unsafe {
        let cap = usize::try_from(*num).unwrap_or(0);
        let out = slice::from_raw_parts_mut(nds, cap);
        let mut written = 0;
        for (slot, rec) in out.iter_mut().zip(&records) {
            slot.fill(rec);
            written += 1;
        }
        *num = written;
    }
    ZTS_ERR_OK
}

/// First assigned address of `family` on `nwid`, port 0.
#[no_mangle]
pub extern "C" fn zts_get_address(nwid: u64, addr: *mut ZtsSockaddrStorage, family: c_int) -> c_int {
    let Some(family) = AddressFamily::from_raw(family) else {
        return ZtsError::InvalidArgument("unsupported address family").code();
    };
    match service().get_address(NetworkId(nwid), family) {
        Ok(ip) => write_storage(ip, addr),
        Err(e) => e.code(),
    }
}

/// 6PLANE address of `node_id` on `nwid`. Works without a running service.
#[no_mangle]
pub extern "C" fn zts_get_6plane_addr(addr: *mut ZtsSockaddrStorage, nwid: u64, node_id: u64) -> c_int {
    let ip = sixplane_address(NetworkId(nwid), NodeId(node_id));
    write_storage(IpAddr::V6(ip), addr)
}

/// RFC4193 address of `node_id` on `nwid`. Works without a running service.
#[no_mangle]
pub extern "C" fn zts_get_rfc4193_addr(addr: *mut ZtsSockaddrStorage, nwid: u64, node_id: u64) -> c_int {
    let ip = rfc4193_address(NetworkId(nwid), NodeId(node_id));
    write_storage(IpAddr::V6(ip), addr)
}

#[no_mangle]
pub extern "C" fn zts_get_peer_count() -> c_int {
    count(service().peer_count())
}

/// Fill up to `*num` entries of `pds`; `*num` is set to the count written.
#[no_mangle]
pub extern "C" fn zts_get_peers(pds: *mut ZtsPeerDetails, num: *mut c_int) -> c_int {
    if pds.is_null() || num.is_null() {
        return ZtsError::InvalidArgument("null peer buffer").code();
    }
    let peers = match service().peers() {
        Ok(p) => p,
        Err(e) => return e.code(),
    };
    unsafe {
        let cap = usize::try_from(*num).unwrap_or(0);
        let out = slice::from_raw_parts_mut(pds, cap);
        let mut written = 0;
        for (slot, peer) in out.iter_mut().zip(&peers) {
            slot.fill(peer);
            written += 1;
        }
        *num = written;
    }
    ZTS_ERR_OK
}

/// PEER_P2P, PEER_RELAY or PEER_UNREACHABLE event code, else an error code.
#[no_mangle]
pub extern "C" fn zts_get_peer_status(node_id: u64) -> c_int {
    match service().peer_status(NodeId(node_id)) {
        Ok(status) => status.event_code().code(),
        Err(e) => e.code(),
    }
}

/// Register a network on the process fabric so a C host can run
/// self-contained. `ipv4_net` is a dotted quad, or null for no IPv4 pool.
#[no_mangle]
pub extern "C" fn zts_fabric_define_network(
    nwid: u64,
    ipv4_net: *const c_char,
    prefix_len: u8,
    private_network: c_int,
) -> c_int {
    let pool = if ipv4_net.is_null() {
        None
    } else {
        let parsed = unsafe { CStr::from_ptr(ipv4_net) }
            .to_str()
            .ok()
            .and_then(|s| s.parse::<Ipv4Addr>().ok());
        match parsed {
            Some(net) if (1..=30).contains(&prefix_len) => Some((net, prefix_len)),
            _ => return ZtsError::InvalidArgument("bad ipv4 pool").code(),
        }
    };
    let mut template = NetworkTemplate::ipv4(&format!("{:016x}", nwid), Ipv4Addr::UNSPECIFIED, 0);
    template.ipv4_pool = pool;
    template.private = private_network != 0;
    fabric().define_network(NetworkId(nwid), template);
    ZTS_ERR_OK
}

// Sockets.

/// errno of the last failed socket call on this thread.
#[no_mangle]
pub extern "C" fn zts_errno() -> c_int {
    ERRNO.with(|e| e.get())
}

#[no_mangle]
pub extern "C" fn zts_socket(family: c_int, ty: c_int, protocol: c_int) -> c_int {
    sock_int(service().socket(family, ty, protocol))
}

#[no_mangle]
pub extern "C" fn zts_bind(fd: c_int, addr: *const ZtsSockaddr, addrlen: u32) -> c_int {
    sock_int(read_sockaddr(addr, addrlen).and_then(|a| service().bind(fd, a)).map(|()| 0))
}

#[no_mangle]
pub extern "C" fn zts_listen(fd: c_int, backlog: c_int) -> c_int {
    sock_int(service().listen(fd, backlog).map(|()| 0))
}

#[no_mangle]
pub extern "C" fn zts_connect(fd: c_int, addr: *const ZtsSockaddr, addrlen: u32) -> c_int {
    sock_int(read_sockaddr(addr, addrlen).and_then(|a| service().connect(fd, a)).map(|()| 0))
}

/// New handle; the peer address goes to `addr` when not null.
#[no_mangle]
pub extern "C" fn zts_accept(fd: c_int, addr: *mut ZtsSockaddr, addrlen: *mut u32) -> c_int {
    zts_accept4(fd, addr, addrlen, 0)
}

/// `flags & O_NONBLOCK` makes this one call non-blocking.
#[no_mangle]
pub extern "C" fn zts_accept4(fd: c_int, addr: *mut ZtsSockaddr, addrlen: *mut u32, flags: c_int) -> c_int {
    sock_int(service().accept4(fd, flags & O_NONBLOCK != 0).map(|(child, peer)| {
        write_sockaddr(peer, addr, addrlen);
        child
    }))
}

#[no_mangle]
pub extern "C" fn zts_send(fd: c_int, buf: *const c_void, len: usize, flags: c_int) -> isize {
    if buf.is_null() && len > 0 {
        return sock_len(Err(ZtsError::InvalidArgument("null buffer")));
    }
    let data = if len == 0 { &[][..] } else { unsafe { slice::from_raw_parts(buf as *const u8, len) } };
    sock_len(service().send(fd, data, flags))
}

#[no_mangle]
pub extern "C" fn zts_sendto(
    fd: c_int,
    buf: *const c_void,
    len: usize,
    flags: c_int,
    addr: *const ZtsSockaddr,
    addrlen: u32,
) -> isize {
    if buf.is_null() && len > 0 {
        return sock_len(Err(ZtsError::InvalidArgument("null buffer")));
    }
    let data = if len == 0 { &[][..] } else { unsafe { slice::from_raw_parts(buf as *const u8, len) } };
    sock_len(read_sockaddr(addr, addrlen).and_then(|dst| service().sendto(fd, data, flags, dst)))
}

/// Gather-send of `msg_iov`; `msg_name`, when set, is the destination.
#[no_mangle]
pub extern "C" fn zts_sendmsg(fd: c_int, msg: *const ZtsMsghdr, flags: c_int) -> isize {
    if msg.is_null() {
        return sock_len(Err(ZtsError::InvalidArgument("null message")));
    }
    let msg = unsafe { &*msg };
    let dst = if msg.msg_name.is_null() {
        None
    } else {
        match read_sockaddr(msg.msg_name as *const ZtsSockaddr, msg.msg_namelen) {
            Ok(a) => Some(a),
            Err(e) => return sock_len(Err(e)),
        }
    };
    let iov = match iovecs(msg.msg_iov, msg.msg_iovlen) {
        Ok(v) => v,
        Err(e) => return sock_len(Err(e)),
    };
    let bufs: Vec<&[u8]> = iov
        .iter()
        .filter(|v| v.iov_len > 0)
        .map(|v| unsafe { slice::from_raw_parts(v.iov_base as *const u8, v.iov_len) })
        .collect();
    sock_len(service().sendmsg(fd, &bufs, flags, dst))
}

/// Scatter-receive into `msg_iov`; the source goes to `msg_name` when set.
#[no_mangle]
pub extern "C" fn zts_recvmsg(fd: c_int, msg: *mut ZtsMsghdr, flags: c_int) -> isize {
    if msg.is_null() {
        return sock_len(Err(ZtsError::InvalidArgument("null message")));
    }
    let msg = unsafe { &mut *msg };
    let iov = match iovecs(msg.msg_iov, msg.msg_iovlen) {
        Ok(v) => v,
        Err(e) => return sock_len(Err(e)),
    };
    let mut bufs: Vec<&mut [u8]> = iov
        .iter()
        .filter(|v| v.iov_len > 0)
        .map(|v| unsafe { slice::from_raw_parts_mut(v.iov_base as *mut u8, v.iov_len) })
        .collect();
    let r = service().recvmsg(fd, &mut bufs, flags).map(|(n, from)| {
        match from {
            Some(from) if !msg.msg_name.is_null() => {
                write_sockaddr(from, msg.msg_name as *mut ZtsSockaddr, &mut msg.msg_namelen)
            }
            _ => msg.msg_namelen = 0,
        }
        msg.msg_controllen = 0;
        msg.msg_flags = 0;
        n
    });
    sock_len(r)
}

fn iovecs<'a>(iov: *mut ZtsIovec, n: c_int) -> Result<&'a [ZtsIovec]> {
    let n = usize::try_from(n).map_err(|_| ZtsError::InvalidArgument("negative iovec count"))?;
    if n == 0 {
        return Ok(&[]);
    }
    if iov.is_null() {
        return Err(ZtsError::InvalidArgument("null iovec"));
    }
    let v = unsafe { slice::from_raw_parts(iov as *const ZtsIovec, n) };
    if v.iter().any(|e| e.iov_base.is_null() && e.iov_len > 0) {
        return Err(ZtsError::InvalidArgument("null iovec buffer"));
    }
    Ok(v)
}

#[no_mangle]
pub extern "C" fn zts_write(fd: c_int, buf: *const c_void, len: usize) -> isize {
    zts_send(fd, buf, len, 0)
}

#[no_mangle]
pub extern "C" fn zts_recv(fd: c_int, buf: *mut c_void, len: usize, flags: c_int) -> isize {
    zts_recvfrom(fd, buf, len, flags, std::ptr::null_mut(), std::ptr::null_mut())
}

#[no_mangle]
pub extern "C" fn zts_recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: usize,
    flags: c_int,
    addr: *mut ZtsSockaddr,
    addrlen: *mut u32,
) -> isize {
    if buf.is_null() && len > 0 {
        return sock_len(Err(ZtsError::InvalidArgument("null buffer")));
    }
    let data: &mut [u8] = if len == 0 {
        &mut []
    } else {
        unsafe { slice::from_raw_parts_mut(buf as *mut u8, len) }
    };
    sock_len(service().recvfrom(fd, data, flags).map(|(n, from)| {
        if let Some(from) = from {
            write_sockaddr(from, addr, addrlen);
        }
        n
    }))
}

#[no_mangle]
pub extern "C" fn zts_read(fd: c_int, buf: *mut c_void, len: usize) -> isize {
    zts_recv(fd, buf, len, 0)
}

#[no_mangle]
pub extern "C" fn zts_shutdown(fd: c_int, how: c_int) -> c_int {
    sock_int(service().shutdown(fd, how).map(|()| 0))
}

#[no_mangle]
pub extern "C" fn zts_close(fd: c_int) -> c_int {
    sock_int(service().close(fd).map(|()| 0))
}

/// The nameserver calls take no length; the family implies it.
const IMPLIED_LEN: u32 = size_of::<ZtsSockaddrIn6>() as u32;

/// Register a DNS nameserver (at most two).
#[no_mangle]
pub extern "C" fn zts_add_dns_nameserver(addr: *const ZtsSockaddr) -> c_int {
    code(read_sockaddr(addr, IMPLIED_LEN).and_then(|a| service().add_dns_nameserver(a.ip())))
}

#[no_mangle]
pub extern "C" fn zts_del_dns_nameserver(addr: *const ZtsSockaddr) -> c_int {
    code(read_sockaddr(addr, IMPLIED_LEN).and_then(|a| service().del_dns_nameserver(a.ip())))
}

/// Copy the hostname, NUL-terminated, into `name` of `len` bytes.
#[no_mangle]
pub extern "C" fn zts_gethostname(name: *mut c_char, len: usize) -> c_int {
    if name.is_null() {
        return sock_int::<i32>(Err(ZtsError::InvalidArgument("null name buffer")));
    }
    let r = service().hostname().and_then(|host| {
        if host.len() >= len {
            return Err(ZtsError::InvalidArgument("name buffer too short"));
        }
        unsafe {
            let out = name as *mut u8;
            out.copy_from_nonoverlapping(host.as_ptr(), host.len());
            *out.add(host.len()) = 0;
        }
        Ok(0)
    });
    sock_int(r)
}

/// Set the hostname from `len` bytes of `name` (no NUL needed).
#[no_mangle]
pub extern "C" fn zts_sethostname(name: *const c_char, len: usize) -> c_int {
    if name.is_null() {
        return sock_int::<i32>(Err(ZtsError::InvalidArgument("null name")));
    }
    let bytes = unsafe { slice::from_raw_parts(name as *const u8, len) };
    let r = std::str::from_utf8(bytes)
        .map_err(|_| ZtsError::InvalidArgument("hostname is not utf-8"))
        .and_then(|host| service().set_hostname(host));
    sock_int(r.map(|()| 0))
}

/// F_GETFL / F_SETFL. Returns the flags for F_GETFL, 0 for F_SETFL.
#[no_mangle]
pub extern "C" fn zts_fcntl(fd: c_int, cmd: c_int, flags: c_int) -> c_int {
    sock_int(service().fcntl(fd, cmd, flags))
}

/// FIONREAD / FIONBIO; `argp` points at an int.
#[no_mangle]
pub extern "C" fn zts_ioctl(fd: c_int, request: c_ulong, argp: *mut c_void) -> c_int {
    if argp.is_null() {
        return sock_int::<i32>(Err(ZtsError::InvalidArgument("null ioctl argument")));
    }
    let arg = unsafe { &mut *(argp as *mut c_int) };
    sock_int(service().ioctl(fd, request as u64, arg).map(|()| 0))
}

fn decode_option(level: c_int, name: c_int, optval: *const c_void, optlen: u32) -> Result<OptionValue> {
    if optval.is_null() {
        return Err(ZtsError::InvalidArgument("null option value"));
    }
    let need = |n: usize| {
        if (optlen as usize) < n {
            Err(ZtsError::InvalidArgument("option length too short"))
        } else {
            Ok(())
        }
    };
    match SockOpt::from_raw(level, name)? {
        SockOpt::Linger => {
            need(size_of::<ZtsLinger>())?;
            let l = unsafe { &*(optval as *const ZtsLinger) };
            if l.l_onoff == 0 {
                Ok(OptionValue::Linger(None))
            } else {
                let secs = u64::try_from(l.l_linger)
                    .map_err(|_| ZtsError::InvalidArgument("negative linger"))?;
                Ok(OptionValue::Linger(Some(Duration::from_secs(secs))))
            }
        }
        SockOpt::SendTimeout | SockOpt::RecvTimeout | SockOpt::ConnectTimeout => {
            need(size_of::<ZtsTimeval>())?;
            let tv = unsafe { &*(optval as *const ZtsTimeval) };
            Ok(OptionValue::Duration(timeval_duration(tv)?))
        }
        _ => {
            need(size_of::<c_int>())?;
            Ok(OptionValue::Int(unsafe { *(optval as *const c_int) }))
        }
    }
}

fn encode_option(value: OptionValue, optval: *mut c_void, optlen: *mut u32) -> Result<()> {
    if optval.is_null() || optlen.is_null() {
        return Err(ZtsError::InvalidArgument("null option buffer"));
    }
    let avail = unsafe { *optlen } as usize;
    let size = match value {
        OptionValue::Int(_) => size_of::<c_int>(),
        OptionValue::Linger(_) => size_of::<ZtsLinger>(),
        OptionValue::Duration(_) => size_of::<ZtsTimeval>(),
    };
    if avail < size {
        return Err(ZtsError::InvalidArgument("option buffer too short"));
    }
    unsafe {
        match value {
            OptionValue::Int(v) => *(optval as *mut c_int) = v,
            OptionValue::Linger(l) => {
                *(optval as *mut ZtsLinger) = ZtsLinger {
                    l_onoff: c_int::from(l.is_some()),
                    l_linger: l.map_or(0, |d| c_int::try_from(d.as_secs()).unwrap_or(c_int::MAX)),
                }
            }
            OptionValue::Duration(d) => {
                *(optval as *mut ZtsTimeval) = ZtsTimeval {
                    tv_sec: d.as_secs() as c_long,
                    tv_usec: c_long::from(d.subsec_micros() as i32),
                }
            }
        }
        *optlen = size as u32;
    }
    Ok(())
}

#[no_mangle]
pub extern "C" fn zts_setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: u32,
) -> c_int {
    let r = decode_option(level, optname, optval, optlen)
        .and_then(|v| service().setsockopt(fd, level, optname, v));
    sock_int(r.map(|()| 0))
}

#[no_mangle]
pub extern "C" fn zts_getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut u32,
) -> c_int {
    let r = service()
        .getsockopt(fd, level, optname)
        .and_then(|v| encode_option(v, optval, optlen));
    sock_int(r.map(|()| 0))
}

#[no_mangle]
pub extern "C" fn zts_getsockname(fd: c_int, addr: *mut ZtsSockaddr, addrlen: *mut u32) -> c_int {
    sock_int(service().getsockname(fd).map(|a| write_sockaddr(a, addr, addrlen)).map(|()| 0))
}

#[no_mangle]
pub extern "C" fn zts_getpeername(fd: c_int, addr: *mut ZtsSockaddr, addrlen: *mut u32) -> c_int {
    sock_int(service().getpeername(fd).map(|a| write_sockaddr(a, addr, addrlen)).map(|()| 0))
}

fn fdset_in(set: *mut ZtsFdSet, nfds: usize) -> Option<FdSet> {
    if set.is_null() {
        return None;
    }
    let bits = unsafe { &(*set).fd_bits };
    Some(
        (0..nfds)
            .filter(|fd| bits[fd / 8] & (1 << (fd % 8)) != 0)
            .map(|fd| fd as i32)
            .collect(),
    )
}

fn fdset_out(set: *mut ZtsFdSet, ready: Option<FdSet>) {
    if let (false, Some(ready)) = (set.is_null(), ready) {
        let bits = unsafe { &mut (*set).fd_bits };
        bits.fill(0);
        for fd in ready.iter().filter_map(|fd| usize::try_from(fd).ok()) {
            if fd < ZTS_FD_SETSIZE {
                bits[fd / 8] |= 1 << (fd % 8);
            }
        }
    }
}

/// Returns the number of ready bits, 0 on timeout, or -1 with errno set.
/// A null `timeout` waits indefinitely.
#[no_mangle]
pub extern "C" fn zts_select(
    nfds: c_int,
    readfds: *mut ZtsFdSet,
    writefds: *mut ZtsFdSet,
    exceptfds: *mut ZtsFdSet,
    timeout: *mut ZtsTimeval,
) -> c_int {
    let limit = usize::try_from(nfds).unwrap_or(0).min(ZTS_FD_SETSIZE);
    let timeout = if timeout.is_null() {
        None
    } else {
        match timeval_duration(unsafe { &*timeout }) {
            Ok(d) => Some(d),
            Err(e) => return sock_int::<i32>(Err(e)),
        }
    };
    let mut r = fdset_in(readfds, limit);
    let mut w = fdset_in(writefds, limit);
    let mut x = fdset_in(exceptfds, limit);
    let n = service().select(limit as i32, r.as_mut(), w.as_mut(), x.as_mut(), timeout);
    if n.is_ok() {
        fdset_out(readfds, r);
        fdset_out(writefds, w);
        fdset_out(exceptfds, x);
    }
    sock_int(n.map(|n| i64::try_from(n).unwrap_or(i64::MAX)))
}
