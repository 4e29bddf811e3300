//! Session-level traffic accounting (conntrack) for monitored hosts.
//!
//! Every monitored host owns eight maps, one per direction and protocol,
//! keyed by the packed remote endpoint. Entries live from the first packet
//! of a session until the GC sweep finds them idle.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::core::attack::AmplificationAttackType;
use crate::utils::get_current_timestamp;

/// Remote endpoint of a session packed into 64 bits.
///
/// Layout: remote IPv4 address in the upper 32 bits, then remote port, then
/// local port. Every (address, port, port) triple maps to a distinct key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConntrackKey(u64);

impl ConntrackKey {
    pub fn pack(remote_ip: Ipv4Addr, remote_port: u16, local_port: u16) -> Self {
        let packed = (u64::from(u32::from(remote_ip)) << 32)
            | (u64::from(remote_port) << 16)
            | u64::from(local_port);
        Self(packed)
    }

    pub fn unpack(&self) -> (Ipv4Addr, u16, u16) {
        let remote_ip = Ipv4Addr::from((self.0 >> 32) as u32);
        let remote_port = (self.0 >> 16) as u16;
        let local_port = self.0 as u16;
        (remote_ip, remote_port, local_port)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Accumulated counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConntrackEntry {
    pub bytes: u64,
    pub packets: u64,
    /// Unix timestamp of the last packet, used by GC
    pub last_update_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionProtocol {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl SessionProtocol {
    pub fn from_ip_protocol(protocol: u8) -> Self {
        match protocol {
            6 => SessionProtocol::Tcp,
            17 => SessionProtocol::Udp,
            1 => SessionProtocol::Icmp,
            _ => SessionProtocol::Other,
        }
    }
}

type SessionMap = DashMap<ConntrackKey, ConntrackEntry>;

/// The eight session maps of one monitored host
#[derive(Debug, Default)]
pub struct HostSessions {
    in_tcp: SessionMap,
    in_udp: SessionMap,
    in_icmp: SessionMap,
    in_other: SessionMap,
    out_tcp: SessionMap,
    out_udp: SessionMap,
    out_icmp: SessionMap,
    out_other: SessionMap,
}

impl HostSessions {
    pub fn map(&self, direction: SessionDirection, protocol: SessionProtocol) -> &DashMap<ConntrackKey, ConntrackEntry> {
        match (direction, protocol) {
            (SessionDirection::Incoming, SessionProtocol::Tcp) => &self.in_tcp,
            (SessionDirection::Incoming, SessionProtocol::Udp) => &self.in_udp,
            (SessionDirection::Incoming, SessionProtocol::Icmp) => &self.in_icmp,
            (SessionDirection::Incoming, SessionProtocol::Other) => &self.in_other,
            (SessionDirection::Outgoing, SessionProtocol::Tcp) => &self.out_tcp,
            (SessionDirection::Outgoing, SessionProtocol::Udp) => &self.out_udp,
            (SessionDirection::Outgoing, SessionProtocol::Icmp) => &self.out_icmp,
            (SessionDirection::Outgoing, SessionProtocol::Other) => &self.out_other,
        }
    }

    fn maps(&self) -> [&SessionMap; 8] {
        [
            &self.in_tcp,
            &self.in_udp,
            &self.in_icmp,
            &self.in_other,
            &self.out_tcp,
            &self.out_udp,
            &self.out_icmp,
            &self.out_other,
        ]
    }

    pub fn len(&self) -> usize {
        self.maps().iter().map(|map| map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.maps().iter().all(|map| map.is_empty())
    }

    /// Drop entries idle since before `cutoff`; returns how many were removed
    fn evict_before(&self, cutoff: u64) -> usize {
        let mut evicted = 0;
        for map in self.maps() {
            let before = map.len();
            map.retain(|_, entry| entry.last_update_time >= cutoff);
            evicted += before.saturating_sub(map.len());
        }
        evicted
    }
}

/// Session table shared by all ingestion workers
#[derive(Debug, Default)]
pub struct ConntrackTable {
    hosts: DashMap<IpAddr, Arc<HostSessions>>,
}

impl ConntrackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one packet of a session, stamped with the wall clock
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        host: IpAddr,
        direction: SessionDirection,
        protocol: SessionProtocol,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        local_port: u16,
        bytes: u64,
    ) {
        self.record_at(
            host,
            direction,
            protocol,
            remote_ip,
            remote_port,
            local_port,
            bytes,
            get_current_timestamp(),
        );
    }

    /// Account one packet of a session at time `now`.
    ///
    /// Adds `bytes` to the byte counter and one to the packet counter.
    #[allow(clippy::too_many_arguments)]
    pub fn record_at(
        &self,
        host: IpAddr,
        direction: SessionDirection,
        protocol: SessionProtocol,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        local_port: u16,
        bytes: u64,
        now: u64,
    ) {
        let sessions = self.host_sessions_or_insert(host);
        let key = ConntrackKey::pack(remote_ip, remote_port, local_port);

        let mut entry = sessions.map(direction, protocol).entry(key).or_default();
        entry.bytes = entry.bytes.saturating_add(bytes);
        entry.packets = entry.packets.saturating_add(1);
        entry.last_update_time = now;
    }

    pub fn get(
        &self,
        host: IpAddr,
        direction: SessionDirection,
        protocol: SessionProtocol,
        key: ConntrackKey,
    ) -> Option<ConntrackEntry> {
        let sessions = self.host_sessions(host)?;
        let entry = sessions.map(direction, protocol).get(&key).map(|entry| *entry);
        entry
    }

    pub fn host_sessions(&self, host: IpAddr) -> Option<Arc<HostSessions>> {
        self.hosts.get(&host).map(|sessions| sessions.value().clone())
    }

    /// Largest sessions of a host by byte count
    pub fn top_sessions(
        &self,
        host: IpAddr,
        direction: SessionDirection,
        protocol: SessionProtocol,
        limit: usize,
    ) -> Vec<(ConntrackKey, ConntrackEntry)> {
        let Some(sessions) = self.host_sessions(host) else {
            return Vec::new();
        };

        let mut entries: Vec<(ConntrackKey, ConntrackEntry)> = sessions
            .map(direction, protocol)
            .iter()
            .map(|item| (*item.key(), *item.value()))
            .collect();
        entries.sort_by(|a, b| b.1.bytes.cmp(&a.1.bytes));
        entries.truncate(limit);
        entries
    }

    /// Reflection service behind the incoming UDP traffic of `host`.
    ///
    /// Sessions are grouped by remote port. A known reflector wins when its
    /// sessions carry more than half of the incoming UDP bytes.
    pub fn classify_amplification(&self, host: IpAddr) -> AmplificationAttackType {
        let Some(sessions) = self.host_sessions(host) else {
            return AmplificationAttackType::Unknown;
        };

        let mut total: u64 = 0;
        let mut by_type: HashMap<AmplificationAttackType, u64> = HashMap::new();
        for item in sessions.map(SessionDirection::Incoming, SessionProtocol::Udp).iter() {
            let (_, remote_port, _) = item.key().unpack();
            let bytes = item.value().bytes;
            total = total.saturating_add(bytes);
            let counted = by_type
                .entry(AmplificationAttackType::from_source_port(remote_port))
                .or_default();
            *counted = counted.saturating_add(bytes);
        }

        by_type
            .into_iter()
            .filter(|(kind, _)| *kind != AmplificationAttackType::Unknown)
            .max_by_key(|(_, bytes)| *bytes)
            .filter(|(_, bytes)| *bytes > total / 2)
            .map(|(kind, _)| kind)
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.hosts.iter().map(|item| item.value().len()).sum()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Remove sessions idle for longer than `inactivity_window` seconds
    pub fn gc(&self, inactivity_window: u64) -> usize {
        self.gc_at(get_current_timestamp(), inactivity_window)
    }

    /// Remove sessions whose last update is older than `now - inactivity_window`.
    ///
    /// All eight maps of every host are swept before returning. Hosts left
    /// without sessions are dropped.
    pub fn gc_at(&self, now: u64, inactivity_window: u64) -> usize {
        let cutoff = now.saturating_sub(inactivity_window);
        let hosts: Vec<(IpAddr, Arc<HostSessions>)> = self
            .hosts
            .iter()
            .map(|item| (*item.key(), item.value().clone()))
            .collect();

        let mut evicted = 0;
        for (host, sessions) in hosts {
            evicted += sessions.evict_before(cutoff);
            // a writer holding its own Arc keeps the strong count above 2
            self.hosts
                .remove_if(&host, |_, current| current.is_empty() && Arc::strong_count(current) <= 2);
        }

        if evicted > 0 {
            debug!("Conntrack GC removed {} idle sessions", evicted);
            metrics::counter!("conntrack_sessions_evicted_total", evicted as u64);
        }
        evicted
    }

    fn host_sessions_or_insert(&self, host: IpAddr) -> Arc<HostSessions> {
        if let Some(sessions) = self.hosts.get(&host) {
            return sessions.value().clone();
        }
        self.hosts.entry(host).or_default().value().clone()
    }
}
