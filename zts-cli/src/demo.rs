//! In-process demo cluster: nodes on one fabric, echo exchange, status report.
//! Everything here blocks; main runs it on the blocking pool.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use zts_core::model::{AF_INET, SOCK_STREAM};
use zts_core::{
    AddressFamily, Event, EventCallback, EventCode, Fabric, Handle, NetworkId, NetworkTemplate, Service,
    ServiceConfig, ZtsError,
};

use crate::config::CliConfig;

const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Node homes: a caller-chosen base directory or a temporary one.
enum Homes {
    Fixed(PathBuf),
    Temp(TempDir),
}

impl Homes {
    fn base(&self) -> &Path {
        match self {
            Homes::Fixed(p) => p,
            Homes::Temp(t) => t.path(),
        }
    }
}

pub struct Cluster {
    nwid: NetworkId,
    nodes: Vec<Arc<Service>>,
    _homes: Homes,
}

fn log_event(name: String) -> EventCallback {
    Arc::new(move |ev: Event| match ev.code {
        EventCode::PeerP2p | EventCode::PeerRelay | EventCode::PeerUnreachable => {
            debug!(node = %name, code = ?ev.code, peer = format_args!("{:010x}", ev.id), "event")
        }
        _ => info!(node = %name, code = ?ev.code, id = format_args!("{:x}", ev.id), "event"),
    })
}

impl Cluster {
    /// Start `count` nodes, each with its own home, and wait until all of
    /// them hold an address on the demo network.
    pub fn start(cfg: &CliConfig, count: usize, home: Option<PathBuf>) -> anyhow::Result<Self> {
        if count == 0 {
            bail!("need at least one node");
        }
        let nwid = cfg.network_id()?;
        let fabric = Fabric::new();
        fabric.define_network(
            nwid,
            NetworkTemplate::ipv4("zts-demo", cfg.ipv4_net, cfg.prefix_len),
        );
        let homes = match home {
            Some(p) => Homes::Fixed(p),
            None => Homes::Temp(tempfile::tempdir().context("create temporary home")?),
        };
        let config = ServiceConfig {
            default_network: Some(nwid.to_string()),
            ..ServiceConfig::default()
        };
        let mut nodes = Vec::with_capacity(count);
        for i in 0..count {
            let name = format!("node{i}");
            let path = homes.base().join(&name);
            let svc = Service::with_config(Arc::new(fabric.clone()), config.clone());
            svc.start(&path, Some(log_event(name.clone())), zts_core::model::DEFAULT_PORT)
                .with_context(|| format!("start {name} in {}", path.display()))?;
            info!(node = %name, id = %svc.node_id()?, "node started");
            nodes.push(Arc::new(svc));
        }
        let cluster = Self {
            nwid,
            nodes,
            _homes: homes,
        };
        cluster.wait_ready()?;
        Ok(cluster)
    }

    fn wait_ready(&self) -> anyhow::Result<()> {
        let deadline = Instant::now() + READY_TIMEOUT;
        for svc in &self.nodes {
            while svc.get_address(self.nwid, AddressFamily::Inet).is_err() {
                if Instant::now() >= deadline {
                    bail!("node {} got no address on {}", svc.node_id()?, self.nwid);
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
        Ok(())
    }

    /// Echo `rounds` payloads of `size` bytes from the first node through an
    /// echo server on the last one.
    pub fn echo(&self, port: u16, size: usize, rounds: u32) -> anyhow::Result<EchoReport> {
        let (client, server) = match self.nodes.as_slice() {
            [first, .., last] => (first.clone(), last.clone()),
            _ => bail!("echo needs two nodes"),
        };
        let server_ip = server.get_address(self.nwid, AddressFamily::Inet)?;
        let dst = SocketAddr::new(server_ip, port);
        let listener = server.socket(AF_INET, SOCK_STREAM, 0)?;
        server.bind(listener, dst).context("bind echo listener")?;
        server.listen(listener, 1)?;
        let echo = thread::Builder::new()
            .name("zts-echo".into())
            .spawn(move || serve_echo(&server, listener))
            .context("spawn echo server")?;

        let fd = client.socket(AF_INET, SOCK_STREAM, 0)?;
        client.connect(fd, dst).with_context(|| format!("connect to {dst}"))?;
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let mut back = vec![0u8; size];
        let started = Instant::now();
        for round in 0..rounds {
            send_all(&client, fd, &payload)?;
            recv_exact(&client, fd, &mut back)?;
            if back != payload {
                bail!("echo round {round} returned different bytes");
            }
            debug!(round, bytes = size, "echo round complete");
        }
        let elapsed = started.elapsed();
        client.close(fd)?;
        let echoed = echo
            .join()
            .map_err(|_| anyhow!("echo server panicked"))??;
        Ok(EchoReport {
            server: server_ip,
            rounds,
            bytes: echoed,
            elapsed,
        })
    }

    pub fn print_status(&self) -> anyhow::Result<()> {
        for svc in &self.nodes {
            println!("node {}  {}", svc.node_id()?, svc.home_path()?.display());
            for net in svc.all_network_details()? {
                println!(
                    "  network {}  {:?}  name={:?} mtu={} ready={}",
                    net.id, net.status, net.name, net.mtu, net.ready
                );
                for a in &net.addresses {
                    println!("    {}/{}", a.ip, a.prefix_len);
                }
            }
            for peer in svc.peers()? {
                let status = svc
                    .peer_status(peer.node_id)
                    .map(|s| format!("{s:?}"))
                    .unwrap_or_else(|e| e.to_string());
                println!(
                    "  peer {}  {:?}  {}  latency={}",
                    peer.node_id,
                    peer.role,
                    status,
                    peer.latency_ms.map_or("-".to_owned(), |l| format!("{l}ms"))
                );
            }
        }
        Ok(())
    }

    /// Stop and free every node; the first failure is reported after all
    /// nodes were tried.
    pub fn shutdown(self) -> anyhow::Result<()> {
        let mut first = None;
        for svc in &self.nodes {
            if let Err(e) = svc.stop().and_then(|()| svc.free()) {
                warn!(error = %e, "node shutdown failed");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

pub struct EchoReport {
    pub server: IpAddr,
    pub rounds: u32,
    pub bytes: usize,
    pub elapsed: Duration,
}

/// Accept one connection and echo until the peer closes. Returns bytes echoed.
fn serve_echo(svc: &Service, listener: Handle) -> anyhow::Result<usize> {
    let (fd, peer) = svc.accept(listener)?;
    debug!(%peer, "echo client connected");
    let mut buf = vec![0u8; 8192];
    let mut total = 0;
    loop {
        let n = svc.recv(fd, &mut buf, 0)?;
        if n == 0 {
            break;
        }
        send_all(svc, fd, &buf[..n])?;
        total += n;
    }
    svc.close(fd)?;
    svc.close(listener)?;
    Ok(total)
}

fn send_all(svc: &Service, fd: Handle, mut data: &[u8]) -> Result<(), ZtsError> {
    while !data.is_empty() {
        let n = svc.send(fd, data, 0)?;
        data = &data[n..];
    }
    Ok(())
}

fn recv_exact(svc: &Service, fd: Handle, buf: &mut [u8]) -> anyhow::Result<()> {
    let mut got = 0;
    while got < buf.len() {
        let n = svc.recv(fd, &mut buf[got..], 0)?;
        if n == 0 {
            bail!("connection closed after {got} of {} bytes", buf.len());
        }
        got += n;
    }
    Ok(())
}
