//! Host group resolution for the DDoS mitigation service.
//!
//! Maps monitored prefixes to the host group that owns them. Tables are
//! built in one go (startup or config reload) and swapped in whole, so
//! lookups running on the evaluation cycle never see a half-built tree.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::Serialize;

use crate::core::network::{CidrMask, PrefixError};
use crate::core::prefix_tree::PrefixTree;
use crate::models::HostGroupConfig;

/// Host group used for prefixes configured without an explicit group
pub const GLOBAL_HOST_GROUP: &str = "global";

/// Result of a successful prefix lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostGroupMatch {
    /// Most specific configured prefix covering the address
    pub prefix: CidrMask,
    pub host_group: String,
    pub parent_host_group: Option<String>,
}

/// Outcome of building tables from configuration
#[derive(Debug, Default)]
pub struct LoadReport {
    pub inserted: usize,
    pub rejected: Vec<(String, PrefixError)>,
}

/// One generation of the resolver's lookup structures
#[derive(Default)]
pub struct HostGroupTables {
    ipv4: PrefixTree<Ipv4Addr, String>,
    ipv6: PrefixTree<Ipv6Addr, String>,
    subnet_to_host_group: BTreeMap<CidrMask, String>,
    host_groups: BTreeMap<String, Vec<CidrMask>>,
    parents: HashMap<String, String>,
}

impl HostGroupTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build tables from host group configuration.
    ///
    /// Malformed prefixes are skipped and listed in the report; every valid
    /// prefix is still loaded.
    pub fn from_config(groups: &[HostGroupConfig]) -> (Self, LoadReport) {
        let mut tables = Self::new();
        let mut report = LoadReport::default();

        for group in groups {
            if let Some(parent) = &group.parent {
                tables.set_parent(&group.name, parent);
            }

            for network in &group.networks {
                match tables.insert_str(network, &group.name) {
                    Ok(_) => report.inserted += 1,
                    Err(e) => {
                        warn!("Skipping network {} of host group {}: {}", network, group.name, e);
                        report.rejected.push((network.clone(), e));
                    }
                }
            }
        }

        (tables, report)
    }

    /// Register `prefix` for `host_group`.
    ///
    /// Re-inserting an identical prefix moves it to the new group and returns
    /// the group it previously belonged to. A group left without prefixes is
    /// dropped from the reverse index.
    pub fn insert(&mut self, prefix: CidrMask, host_group: &str) -> Option<String> {
        let replaced = match prefix {
            CidrMask::V4 { network, prefix_len } => {
                self.ipv4.insert(network, prefix_len, host_group.to_string())
            }
            CidrMask::V6 { network, prefix_len } => {
                self.ipv6.insert(network, prefix_len, host_group.to_string())
            }
        };

        if let Some(previous) = &replaced {
            if let Some(subnets) = self.host_groups.get_mut(previous) {
                subnets.retain(|subnet| *subnet != prefix);
                if subnets.is_empty() {
                    self.host_groups.remove(previous);
                }
            }
            if previous != host_group {
                debug!("Prefix {} moved from host group {} to {}", prefix, previous, host_group);
            }
        }

        self.subnet_to_host_group.insert(prefix, host_group.to_string());
        self.host_groups
            .entry(host_group.to_string())
            .or_default()
            .push(prefix);

        replaced
    }

    /// Parse and register a prefix; the tables are untouched on error.
    pub fn insert_str(&mut self, cidr: &str, host_group: &str) -> Result<Option<String>, PrefixError> {
        let prefix: CidrMask = cidr.parse()?;
        Ok(self.insert(prefix, host_group))
    }

    pub fn set_parent(&mut self, host_group: &str, parent: &str) {
        self.parents.insert(host_group.to_string(), parent.to_string());
    }

    pub fn lookup_best(&self, address: IpAddr) -> Option<HostGroupMatch> {
        let (prefix, host_group) = match address {
            IpAddr::V4(v4) => {
                let (prefix_len, group) = self.ipv4.lookup_best(v4)?;
                (CidrMask::v4(v4, prefix_len).ok()?, group)
            }
            IpAddr::V6(v6) => {
                let (prefix_len, group) = self.ipv6.lookup_best(v6)?;
                (CidrMask::v6(v6, prefix_len).ok()?, group)
            }
        };

        Some(HostGroupMatch {
            prefix,
            host_group: host_group.clone(),
            parent_host_group: self.parents.get(host_group).cloned(),
        })
    }

    pub fn host_group_of(&self, prefix: &CidrMask) -> Option<&str> {
        self.subnet_to_host_group.get(prefix).map(String::as_str)
    }

    pub fn subnets(&self, host_group: &str) -> &[CidrMask] {
        self.host_groups
            .get(host_group)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn host_group_names(&self) -> impl Iterator<Item = &str> {
        self.host_groups.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ipv4.len() + self.ipv6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared, reloadable prefix resolver
pub struct HostGroupResolver {
    tables: RwLock<Arc<HostGroupTables>>,
}

impl HostGroupResolver {
    pub fn new(tables: HostGroupTables) -> Self {
        Self {
            tables: RwLock::new(Arc::new(tables)),
        }
    }

    pub fn from_config(groups: &[HostGroupConfig]) -> (Self, LoadReport) {
        let (tables, report) = HostGroupTables::from_config(groups);
        info!(
            "Loaded {} prefixes into {} host groups ({} rejected)",
            report.inserted,
            groups.len(),
            report.rejected.len()
        );
        (Self::new(tables), report)
    }

    /// Current generation of the tables
    pub fn snapshot(&self) -> Arc<HostGroupTables> {
        self.tables.read().clone()
    }

    pub fn lookup_best(&self, address: IpAddr) -> Option<HostGroupMatch> {
        self.snapshot().lookup_best(address)
    }

    /// Replace the tables; in-flight lookups finish on the old generation.
    pub fn reload(&self, tables: HostGroupTables) {
        let tables = Arc::new(tables);
        info!("Reloading host group tables: {} prefixes", tables.len());
        *self.tables.write() = tables;
    }
}

impl Default for HostGroupResolver {
    fn default() -> Self {
        Self::new(HostGroupTables::new())
    }
}
