//! Joined networks: one record per membership, updated by the driver from
//! overlay status and configuration events.
//!
//! The table turns those updates into the event codes the application sees.
//! Status codes are emitted once per change; address deltas produce the
//! NETIF_* and NETWORK_READY_* codes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, ZtsError};
use crate::model::{
    AddressFamily, AddressRecord, EventCode, NetworkConfig, NetworkId, NetworkRecord,
    NetworkStatus, RouteRecord, MAX_ASSIGNED_ADDRESSES, MAX_NETWORK_ROUTES,
};

fn status_code(status: NetworkStatus) -> EventCode {
    match status {
        NetworkStatus::RequestingConfiguration => EventCode::NetworkRequestingConfig,
        NetworkStatus::Ok => EventCode::NetworkOk,
        NetworkStatus::AccessDenied => EventCode::NetworkAccessDenied,
        NetworkStatus::NotFound => EventCode::NetworkNotFound,
        NetworkStatus::ClientTooOld => EventCode::NetworkClientTooOld,
        NetworkStatus::Down => EventCode::NetworkDown,
    }
}

fn up_code(family: AddressFamily) -> EventCode {
    match family {
        AddressFamily::Inet => EventCode::NetifUpIp4,
        AddressFamily::Inet6 => EventCode::NetifUpIp6,
    }
}

fn down_code(family: AddressFamily) -> EventCode {
    match family {
        AddressFamily::Inet => EventCode::NetifDownIp4,
        AddressFamily::Inet6 => EventCode::NetifDownIp6,
    }
}

fn ready_code(family: AddressFamily) -> EventCode {
    match family {
        AddressFamily::Inet => EventCode::NetworkReadyIp4,
        AddressFamily::Inet6 => EventCode::NetworkReadyIp6,
    }
}

const FAMILIES: [AddressFamily; 2] = [AddressFamily::Inet, AddressFamily::Inet6];

fn has_family(addrs: &[AddressRecord], family: AddressFamily) -> bool {
    addrs.iter().any(|a| a.family() == family)
}

/// What the driver must push into the stack after a configuration update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDelta {
    pub added: Vec<AddressRecord>,
    pub removed: Vec<AddressRecord>,
    pub mtu: u32,
    pub routes: Vec<RouteRecord>,
    pub events: Vec<EventCode>,
}

struct Entry {
    record: NetworkRecord,
    last_emitted: Option<NetworkStatus>,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<NetworkId, Entry>,
    next_seq: u64,
}

#[derive(Default)]
pub struct NetworkTable {
    inner: Mutex<Inner>,
}

impl NetworkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record in RequestingConfiguration. False if already present.
    pub fn insert(&self, nwid: NetworkId) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&nwid) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            nwid,
            Entry {
                record: NetworkRecord {
                    id: nwid,
                    name: String::new(),
                    joined_at: SystemTime::now(),
                    status: NetworkStatus::RequestingConfiguration,
                    ready: false,
                    mtu: 0,
                    addresses: Vec::new(),
                    routes: Vec::new(),
                },
                last_emitted: None,
                seq,
            },
        );
        true
    }

    pub fn remove(&self, nwid: NetworkId) -> Option<NetworkRecord> {
        self.inner.lock().entries.remove(&nwid).map(|e| e.record)
    }

    /// Drop every record, returning their ids in join order.
    pub fn clear(&self) -> Vec<NetworkId> {
        let mut inner = self.inner.lock();
        let mut entries: Vec<(u64, NetworkId)> =
            inner.entries.drain().map(|(id, e)| (e.seq, id)).collect();
        entries.sort();
        entries.into_iter().map(|(_, id)| id).collect()
    }

    pub fn contains(&self, nwid: NetworkId) -> bool {
        self.inner.lock().entries.contains_key(&nwid)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Joined ids in join order.
    pub fn ids(&self) -> Vec<NetworkId> {
        self.all().into_iter().map(|r| r.id).collect()
    }

    pub fn details(&self, nwid: NetworkId) -> Option<NetworkRecord> {
        self.inner.lock().entries.get(&nwid).map(|e| e.record.clone())
    }

    /// Every record in join order.
    pub fn all(&self) -> Vec<NetworkRecord> {
        let inner = self.inner.lock();
        let mut entries: Vec<&Entry> = inner.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    fn with_record<T>(&self, nwid: NetworkId, f: impl FnOnce(&NetworkRecord) -> Result<T>) -> Result<T> {
        let inner = self.inner.lock();
        let entry = inner
            .entries
            .get(&nwid)
            .ok_or(ZtsError::InvalidArgument("network not joined"))?;
        f(&entry.record)
    }

    /// First address of `family` in assignment order. This is first-found,
    /// not a preferred-address choice.
    pub fn address(&self, nwid: NetworkId, family: AddressFamily) -> Result<IpAddr> {
        self.with_record(nwid, |r| {
            r.addresses
                .iter()
                .find(|a| a.family() == family)
                .map(|a| a.ip)
                .ok_or(ZtsError::InvalidArgument("no address of that family"))
        })
    }

    pub fn address_at(&self, nwid: NetworkId, index: usize) -> Result<AddressRecord> {
        self.with_record(nwid, |r| {
            r.addresses
                .get(index)
                .copied()
                .ok_or(ZtsError::InvalidArgument("address index out of range"))
        })
    }

    pub fn num_addresses(&self, nwid: NetworkId) -> Result<usize> {
        self.with_record(nwid, |r| Ok(r.addresses.len()))
    }

    pub fn has_address(&self, nwid: NetworkId) -> Result<bool> {
        self.with_record(nwid, |r| Ok(!r.addresses.is_empty()))
    }

    /// Whether `nwid` is joined and ready.
    pub fn is_ready(&self, nwid: NetworkId) -> bool {
        self.inner
            .lock()
            .entries
            .get(&nwid)
            .is_some_and(|e| e.record.ready)
    }

    /// Record a controller status. Returns the codes to emit: the status code
    /// when it differs from the last one emitted, plus readiness codes when
    /// the network turns Ok with addresses already assigned.
    pub fn apply_status(&self, nwid: NetworkId, status: NetworkStatus) -> Vec<EventCode> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&nwid) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        let was_ok = entry.record.status == NetworkStatus::Ok;
        entry.record.status = status;
        if entry.last_emitted != Some(status) {
            entry.last_emitted = Some(status);
            events.push(status_code(status));
        }
        if status == NetworkStatus::Ok && !was_ok {
            for family in FAMILIES {
                if has_family(&entry.record.addresses, family) {
                    events.push(ready_code(family));
                }
            }
        }
        entry.record.ready = status == NetworkStatus::Ok && !entry.record.addresses.is_empty();
        debug!(network = %nwid, ?status, ready = entry.record.ready, "network status");
        events
    }

    /// Replace the configuration of `nwid`. `None` when the network is not
    /// joined (a late update after leave).
    pub fn apply_config(&self, nwid: NetworkId, mut config: NetworkConfig) -> Option<ConfigDelta> {
        if config.addresses.len() > MAX_ASSIGNED_ADDRESSES {
            warn!(
                network = %nwid,
                assigned = config.addresses.len(),
                kept = MAX_ASSIGNED_ADDRESSES,
                "truncating assigned addresses"
            );
            config.addresses.truncate(MAX_ASSIGNED_ADDRESSES);
        }
        if config.routes.len() > MAX_NETWORK_ROUTES {
            warn!(
                network = %nwid,
                routes = config.routes.len(),
                kept = MAX_NETWORK_ROUTES,
                "truncating managed routes"
            );
            config.routes.truncate(MAX_NETWORK_ROUTES);
        }
        let mut addresses: Vec<AddressRecord> = Vec::with_capacity(config.addresses.len());
        for a in config.addresses {
            if !addresses.iter().any(|b| b.ip == a.ip) {
                addresses.push(a);
            }
        }

        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&nwid)?;
        let record = &mut entry.record;
        let removed: Vec<AddressRecord> = record
            .addresses
            .iter()
            .filter(|old| !addresses.iter().any(|a| a.ip == old.ip))
            .copied()
            .collect();
        let added: Vec<AddressRecord> = addresses
            .iter()
            .filter(|new| !record.addresses.iter().any(|a| a.ip == new.ip))
            .copied()
            .collect();

        let mut events = Vec::new();
        let ok = record.status == NetworkStatus::Ok;
        for family in FAMILIES {
            if has_family(&record.addresses, family) && !has_family(&addresses, family) {
                events.push(down_code(family));
            }
        }
        let mut present: Vec<AddressRecord> = record
            .addresses
            .iter()
            .filter(|a| !removed.contains(a))
            .copied()
            .collect();
        for a in &added {
            if has_family(&present, a.family()) {
                events.push(EventCode::NetifNewAddress);
            } else {
                events.push(up_code(a.family()));
                if ok {
                    events.push(ready_code(a.family()));
                }
            }
            present.push(*a);
        }

        record.name = config.name;
        record.mtu = config.mtu;
        record.addresses = addresses;
        record.routes = config.routes;
        record.ready = ok && !record.addresses.is_empty();
        debug!(
            network = %nwid,
            added = added.len(),
            removed = removed.len(),
            ready = record.ready,
            "network config applied"
        );
        Some(ConfigDelta {
            added,
            removed,
            mtu: record.mtu,
            routes: record.routes.clone(),
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NWID: NetworkId = NetworkId(0x8056_c2e2_1c00_0001);

    fn v4(s: &str) -> AddressRecord {
        AddressRecord::new(s.parse().unwrap(), 24)
    }

    fn v6(s: &str) -> AddressRecord {
        AddressRecord::new(s.parse().unwrap(), 88)
    }

    fn config(addresses: Vec<AddressRecord>) -> NetworkConfig {
        NetworkConfig {
            name: "lab".into(),
            mtu: 2800,
            addresses,
            routes: Vec::new(),
        }
    }

    #[test]
    fn insert_is_idempotent() {
        let t = NetworkTable::new();
        assert!(t.insert(NWID));
        assert!(!t.insert(NWID));
        assert_eq!(t.len(), 1);
        assert_eq!(t.details(NWID).unwrap().status, NetworkStatus::RequestingConfiguration);
    }

    #[test]
    fn status_codes_emitted_once_per_change() {
        let t = NetworkTable::new();
        t.insert(NWID);
        assert_eq!(
            t.apply_status(NWID, NetworkStatus::RequestingConfiguration),
            vec![EventCode::NetworkRequestingConfig]
        );
        assert!(t.apply_status(NWID, NetworkStatus::RequestingConfiguration).is_empty());
        assert_eq!(t.apply_status(NWID, NetworkStatus::Ok), vec![EventCode::NetworkOk]);
        assert!(!t.is_ready(NWID));
        assert!(t.apply_status(NetworkId(7), NetworkStatus::Ok).is_empty());
    }

    #[test]
    fn first_address_per_family_brings_interface_up() {
        let t = NetworkTable::new();
        t.insert(NWID);
        t.apply_status(NWID, NetworkStatus::Ok);
        let d = t
            .apply_config(NWID, config(vec![v4("10.0.0.1"), v6("fd00::1"), v4("10.0.0.2")]))
            .unwrap();
        assert_eq!(
            d.events,
            vec![
                EventCode::NetifUpIp4,
                EventCode::NetworkReadyIp4,
                EventCode::NetifUpIp6,
                EventCode::NetworkReadyIp6,
                EventCode::NetifNewAddress,
            ]
        );
        assert_eq!(d.added.len(), 3);
        assert!(t.is_ready(NWID));
        assert_eq!(t.address(NWID, AddressFamily::Inet).unwrap(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(t.address_at(NWID, 1).unwrap(), v6("fd00::1"));
        assert_eq!(t.num_addresses(NWID).unwrap(), 3);

        let d = t.apply_config(NWID, config(vec![v4("10.0.0.2")])).unwrap();
        assert_eq!(d.events, vec![EventCode::NetifDownIp6]);
        assert_eq!(d.removed, vec![v4("10.0.0.1"), v6("fd00::1")]);
        assert!(t.address(NWID, AddressFamily::Inet6).is_err());
    }

    #[test]
    fn readiness_follows_late_ok_status() {
        let t = NetworkTable::new();
        t.insert(NWID);
        let d = t.apply_config(NWID, config(vec![v4("10.0.0.1")])).unwrap();
        assert_eq!(d.events, vec![EventCode::NetifUpIp4]);
        assert!(!t.is_ready(NWID));
        assert_eq!(
            t.apply_status(NWID, NetworkStatus::Ok),
            vec![EventCode::NetworkOk, EventCode::NetworkReadyIp4]
        );
        assert!(t.is_ready(NWID));
    }

    #[test]
    fn config_lists_are_truncated() {
        let t = NetworkTable::new();
        t.insert(NWID);
        let addrs: Vec<AddressRecord> = (1..=20).map(|i| v4(&format!("10.0.0.{i}"))).collect();
        let mut c = config(addrs);
        c.routes = (0..40)
            .map(|i| RouteRecord {
                target: IpAddr::from([10, i, 0, 0]),
                prefix_len: 16,
                via: None,
                flags: 0,
                metric: 0,
            })
            .collect();
        t.apply_config(NWID, c).unwrap();
        let r = t.details(NWID).unwrap();
        assert_eq!(r.addresses.len(), MAX_ASSIGNED_ADDRESSES);
        assert_eq!(r.routes.len(), MAX_NETWORK_ROUTES);
    }

    #[test]
    fn unknown_network_queries() {
        let t = NetworkTable::new();
        assert!(t.apply_config(NWID, config(vec![v4("10.0.0.1")])).is_none());
        assert_eq!(
            t.has_address(NWID),
            Err(ZtsError::InvalidArgument("network not joined"))
        );
        assert!(t.address_at(NWID, 0).is_err());
    }

    #[test]
    fn records_keep_join_order() {
        let t = NetworkTable::new();
        for id in [5, 3, 9] {
            t.insert(NetworkId(id));
        }
        assert_eq!(t.ids(), vec![NetworkId(5), NetworkId(3), NetworkId(9)]);
        t.remove(NetworkId(3));
        assert_eq!(t.clear(), vec![NetworkId(5), NetworkId(9)]);
        assert!(t.is_empty());
    }
}
