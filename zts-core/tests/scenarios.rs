//! Multi-node scenarios: several services sharing one in-process fabric.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;
use zts_core::model::{AF_INET, O_NONBLOCK, F_SETFL, SOCK_STREAM};
use zts_core::{
    AddressFamily, Event, EventCode, Fabric, FdSet, LinkState, NetworkId, NetworkStatus, NetworkTemplate,
    NodeId, PeerStatus, Service, ServiceConfig, ServiceState, SocketState, ZtsError,
};
use zts_core::fabric::PLANET_NODE_ID;
use zts_core::model::PeerRole;

const NWID: NetworkId = NetworkId(0x8056_c2e2_1c00_0001);
const PORT: u16 = 9994;

struct Node {
    svc: Service,
    events: Arc<Mutex<Vec<Event>>>,
    _home: TempDir,
}

impl Node {
    fn start(fabric: &Fabric, config: ServiceConfig) -> Self {
        let home = tempfile::tempdir().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let svc = Service::with_config(Arc::new(fabric.clone()), config);
        svc.start(home.path(), Some(Arc::new(move |ev| sink.lock().push(ev))), PORT)
            .unwrap();
        Self {
            svc,
            events,
            _home: home,
        }
    }

    fn id(&self) -> NodeId {
        self.svc.node_id().unwrap()
    }

    /// Join and wait for an IPv4 address.
    fn join_ready(&self, nwid: NetworkId) -> IpAddr {
        self.svc.join(nwid).unwrap();
        eventually(|| self.svc.network_details(nwid).is_ok_and(|r| r.ready));
        self.svc.get_address(nwid, AddressFamily::Inet).unwrap()
    }

    fn codes_for(&self, id: u64) -> Vec<EventCode> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.id == id)
            .map(|e| e.code)
            .collect()
    }

    fn saw(&self, code: EventCode, id: u64) -> bool {
        self.codes_for(id).contains(&code)
    }
}

fn quick() -> ServiceConfig {
    ServiceConfig {
        startup_timeout_ms: 5_000,
        tick_interval_ms: 2,
        connect_timeout_ms: 3_000,
        ..ServiceConfig::default()
    }
}

fn lab() -> Fabric {
    let fabric = Fabric::new();
    fabric.define_network(NWID, NetworkTemplate::ipv4("lab", Ipv4Addr::new(10, 147, 17, 0), 24));
    fabric
}

fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn stream(svc: &Service) -> i32 {
    svc.socket(AF_INET, SOCK_STREAM, 0).unwrap()
}

fn listener(svc: &Service, ip: IpAddr, port: u16, backlog: i32) -> i32 {
    let fd = stream(svc);
    svc.bind(fd, SocketAddr::new(ip, port)).unwrap();
    svc.listen(fd, backlog).unwrap();
    fd
}

#[test]
fn join_then_connect_end_to_end() {
    let fabric = lab();
    let a = Node::start(&fabric, quick());
    let b = Node::start(&fabric, quick());
    eventually(|| a.saw(EventCode::NodeOnline, a.id().0));

    let a_ip = a.join_ready(NWID);
    eventually(|| a.saw(EventCode::NetworkReadyIp4, NWID.0));
    let codes = a.codes_for(NWID.0);
    let requesting = codes.iter().position(|c| *c == EventCode::NetworkRequestingConfig);
    let ready = codes.iter().position(|c| *c == EventCode::NetworkReadyIp4);
    assert!(requesting.is_some() && requesting < ready, "{codes:?}");
    let record = a.svc.network_details(NWID).unwrap();
    assert_eq!(record.status, NetworkStatus::Ok);
    assert_eq!(record.name, "lab");
    assert!(record.addresses.iter().any(|r| r.ip == a_ip));
    assert!(a.svc.has_address(NWID).unwrap());

    let b_ip = b.join_ready(NWID);
    assert_ne!(a_ip, b_ip);
    let srv = listener(&b.svc, b_ip, 7000, 4);

    let fd = stream(&a.svc);
    assert_eq!(fd, 0);
    a.svc.connect(fd, SocketAddr::new(b_ip, 7000)).unwrap();
    assert_eq!(a.svc.socket_state(fd).unwrap(), SocketState::Connected);

    let (child, peer) = b.svc.accept(srv).unwrap();
    assert_eq!(peer.ip(), a_ip);
    assert_eq!(a.svc.getpeername(fd).unwrap(), SocketAddr::new(b_ip, 7000));
    assert_eq!(a.svc.send(fd, b"ping", 0).unwrap(), 4);
    let mut buf = [0u8; 16];
    let n = b.svc.recv(child, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"ping");
    b.svc.write(child, b"pong").unwrap();
    let n = a.svc.read(fd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong");

    a.svc.close(fd).unwrap();
    assert_eq!(b.svc.recv(child, &mut buf, 0), Ok(0));
}

#[test]
fn double_join_keeps_one_record() {
    let fabric = lab();
    let a = Node::start(&fabric, quick());
    a.svc.join(NWID).unwrap();
    a.svc.join(NWID).unwrap();
    assert_eq!(a.svc.num_joined_networks().unwrap(), 1);
    eventually(|| a.svc.network_details(NWID).is_ok_and(|r| r.ready));
    assert_eq!(a.svc.all_network_details().unwrap().len(), 1);
}

#[test]
fn unknown_network_is_reported_not_found() {
    let fabric = lab();
    let a = Node::start(&fabric, quick());
    let ghost = NetworkId(0xdead_beef_0000_0001);
    a.svc.join(ghost).unwrap();
    eventually(|| a.saw(EventCode::NetworkNotFound, ghost.0));
    assert_eq!(a.svc.network_details(ghost).unwrap().status, NetworkStatus::NotFound);
    assert!(!a.svc.has_address(ghost).unwrap());
}

#[test]
fn private_network_waits_for_authorization() {
    let fabric = lab();
    let secret = NetworkId(0x8056_c2e2_1c00_0002);
    let mut template = NetworkTemplate::ipv4("secret", Ipv4Addr::new(10, 9, 0, 0), 16);
    template.private = true;
    fabric.define_network(secret, template);

    let a = Node::start(&fabric, quick());
    a.svc.join(secret).unwrap();
    eventually(|| a.saw(EventCode::NetworkAccessDenied, secret.0));
    assert!(!a.svc.has_address(secret).unwrap());

    fabric.authorize(secret, a.id()).unwrap();
    eventually(|| a.svc.network_details(secret).is_ok_and(|r| r.ready));
    assert!(a.saw(EventCode::NetworkOk, secret.0));
}

#[test]
fn close_twice_is_rejected() {
    let fabric = lab();
    let a = Node::start(&fabric, quick());
    let fd = stream(&a.svc);
    a.svc.close(fd).unwrap();
    assert!(matches!(a.svc.close(fd), Err(ZtsError::InvalidArgument(_))));
}

#[test]
fn unreachable_connect_fails_and_leaves_closing() {
    let fabric = lab();
    let a = Node::start(&fabric, quick());
    a.join_ready(NWID);
    let fd = stream(&a.svc);
    let started = Instant::now();
    let err = a
        .svc
        .connect(fd, "10.147.17.250:80".parse().unwrap())
        .unwrap_err();
    assert_eq!(err, ZtsError::HostUnreachable);
    assert!(started.elapsed() < Duration::from_millis(quick().connect_timeout_ms + 500));
    assert_eq!(a.svc.socket_state(fd).unwrap(), SocketState::Closing);
}

#[test]
fn full_backlog_refuses_the_next_connection() {
    let fabric = lab();
    let a = Node::start(&fabric, quick());
    let b = Node::start(&fabric, quick());
    a.join_ready(NWID);
    let b_ip = b.join_ready(NWID);
    let srv = listener(&b.svc, b_ip, 7100, 2);
    let dst = SocketAddr::new(b_ip, 7100);

    let first = stream(&a.svc);
    let second = stream(&a.svc);
    let third = stream(&a.svc);
    a.svc.connect(first, dst).unwrap();
    a.svc.connect(second, dst).unwrap();
    assert_eq!(a.svc.connect(third, dst), Err(ZtsError::ConnectionRefused));

    b.svc.accept(srv).unwrap();
    b.svc.accept(srv).unwrap();
    b.svc.fcntl(srv, F_SETFL, O_NONBLOCK).unwrap();
    assert_eq!(b.svc.accept(srv), Err(ZtsError::WouldBlock));
}

#[test]
fn constrained_send_is_partial_without_loss() {
    let fabric = lab();
    let small = ServiceConfig {
        send_buffer: 4096,
        recv_buffer: 4096,
        ..quick()
    };
    let a = Node::start(&fabric, small.clone());
    let b = Node::start(&fabric, small);
    a.join_ready(NWID);
    let b_ip = b.join_ready(NWID);
    let srv = listener(&b.svc, b_ip, 7200, 1);
    let fd = stream(&a.svc);
    a.svc.connect(fd, SocketAddr::new(b_ip, 7200)).unwrap();
    let (child, _) = b.svc.accept(srv).unwrap();

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let first = a.svc.send(fd, &payload, 0).unwrap();
    assert!(first > 0 && first < payload.len());

    let expected = payload.clone();
    let reader = thread::scope(|scope| {
        let r = scope.spawn(|| {
            let mut got = Vec::new();
            let mut buf = [0u8; 1500];
            while got.len() < expected.len() {
                let n = b.svc.recv(child, &mut buf, 0).unwrap();
                assert!(n > 0);
                got.extend_from_slice(&buf[..n]);
            }
            got
        });
        let mut sent = first;
        while sent < payload.len() {
            sent += a.svc.send(fd, &payload[sent..], 0).unwrap();
        }
        r.join().unwrap()
    });
    assert_eq!(reader, expected);
}

#[test]
fn select_with_zero_timeout_returns_immediately() {
    let fabric = lab();
    let a = Node::start(&fabric, quick());
    let ip = a.join_ready(NWID);
    let srv = listener(&a.svc, ip, 7300, 1);
    let mut read: FdSet = [srv].into_iter().collect();
    let started = Instant::now();
    let n = a
        .svc
        .select(srv + 1, Some(&mut read), None, None, Some(Duration::ZERO))
        .unwrap();
    assert_eq!(n, 0);
    assert!(read.is_empty());
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[test]
fn stop_wakes_blocked_callers_and_gates_operations() {
    let fabric = lab();
    let a = Node::start(&fabric, quick());
    let ip = a.join_ready(NWID);
    let srv = listener(&a.svc, ip, 7400, 1);
    let id = a.id();
    thread::scope(|scope| {
        let blocked = scope.spawn(|| a.svc.accept(srv));
        thread::sleep(Duration::from_millis(50));
        a.svc.stop().unwrap();
        assert_eq!(blocked.join().unwrap(), Err(ZtsError::ServiceUnavailable));
    });
    assert_eq!(a.svc.state(), ServiceState::Stopped);
    assert_eq!(a.svc.socket(AF_INET, SOCK_STREAM, 0), Err(ZtsError::ServiceUnavailable));
    eventually(|| a.saw(EventCode::NetworkStackDown, id.0));

    a.svc.start(a._home.path(), None, PORT).unwrap();
    assert!(a.svc.is_running());
    eventually(|| a.svc.network_details(NWID).is_ok_and(|r| r.ready));
}

#[test]
fn leave_emits_removal_then_down() {
    let fabric = lab();
    let a = Node::start(&fabric, quick());
    a.join_ready(NWID);
    a.svc.leave(NWID).unwrap();
    assert_eq!(a.svc.num_joined_networks().unwrap(), 0);
    eventually(|| a.saw(EventCode::NetworkDown, NWID.0));
    let codes = a.codes_for(NWID.0);
    let removed = codes.iter().position(|c| *c == EventCode::NetifRemoved);
    let down = codes.iter().position(|c| *c == EventCode::NetworkDown);
    assert!(removed.is_some() && removed < down, "{codes:?}");
    assert!(matches!(a.svc.leave(NWID), Err(ZtsError::InvalidArgument(_))));
    assert!(a.svc.get_address(NWID, AddressFamily::Inet).is_err());
}

#[test]
fn peers_follow_traffic_and_link_state() {
    let fabric = lab();
    let a = Node::start(&fabric, quick());
    let b = Node::start(&fabric, quick());
    a.join_ready(NWID);
    let b_ip = b.join_ready(NWID);
    let srv = listener(&b.svc, b_ip, 7500, 1);
    let fd = stream(&a.svc);
    a.svc.connect(fd, SocketAddr::new(b_ip, 7500)).unwrap();
    b.svc.accept(srv).unwrap();

    let b_id = b.id();
    eventually(|| a.saw(EventCode::PeerP2p, b_id.0));
    let peers = a.svc.peers().unwrap();
    assert!(peers.iter().any(|p| p.node_id == PLANET_NODE_ID && p.role == PeerRole::Planet));
    assert!(peers.iter().any(|p| p.node_id == b_id && p.role == PeerRole::Leaf));
    assert_eq!(a.svc.peer_count().unwrap(), peers.len());
    assert_eq!(a.svc.peer_status(b_id).unwrap(), PeerStatus::Direct);

    fabric.set_link(a.id(), b_id, LinkState::Relayed);
    eventually(|| a.saw(EventCode::PeerRelay, b_id.0));
    assert_eq!(a.svc.peer_status(b_id).unwrap(), PeerStatus::Relayed);
    assert!(matches!(
        a.svc.peer_status(NodeId(0x12_3456_789a)),
        Err(ZtsError::InvalidArgument(_))
    ));
}

#[test]
fn orbit_and_deorbit_a_moon() {
    let fabric = lab();
    fabric.define_moon(0x0000_00aa_bbcc_ddee, 0x0000_00aa_bbcc_ddee);
    let a = Node::start(&fabric, quick());
    assert!(a.svc.orbit(0x0000_00aa_bbcc_ddee, 1).is_err());
    a.svc.orbit(0x0000_00aa_bbcc_ddee, 0x0000_00aa_bbcc_ddee).unwrap();
    assert!(a.svc.peers().unwrap().iter().any(|p| p.role == PeerRole::Moon));
    a.svc.deorbit(0x0000_00aa_bbcc_ddee).unwrap();
    assert!(a.svc.deorbit(0x0000_00aa_bbcc_ddee).is_err());
    assert!(!a.svc.peers().unwrap().iter().any(|p| p.role == PeerRole::Moon));
}

#[test]
fn default_network_is_ready_when_start_returns() {
    let fabric = lab();
    let config = ServiceConfig {
        default_network: Some(NWID.to_string()),
        ..quick()
    };
    let a = Node::start(&fabric, config);
    assert!(a.svc.network_details(NWID).unwrap().ready);
    assert!(a.svc.get_address(NWID, AddressFamily::Inet).is_ok());
}
