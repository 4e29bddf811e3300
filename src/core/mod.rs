//! Core functionality for the DDoS mitigation service.
//!
//! This module contains the detection core: prefix resolution, session
//! tracking, threshold evaluation, the ban lifecycle and Flow Spec output.

pub mod network;
pub mod prefix_tree;
pub mod host_groups;
pub mod counters;
pub mod conntrack;
pub mod thresholds;
pub mod attack;
pub mod banlist;
pub mod flow_spec;
pub mod serializers;
pub mod engine;

pub use network::{CidrMask, PrefixError};
pub use prefix_tree::PrefixTree;
pub use host_groups::{HostGroupMatch, HostGroupResolver, HostGroupTables, LoadReport, GLOBAL_HOST_GROUP};
pub use counters::{Direction, EntitySnapshot, TotalSpeedCounters, TrafficCounters, TrafficElement, TrafficSnapshotSupplier, TrafficSortOrder};
pub use conntrack::{ConntrackEntry, ConntrackKey, ConntrackTable, SessionDirection, SessionProtocol};
pub use thresholds::{evaluate, BanSettings, ThresholdBreach};
pub use attack::{AmplificationAttackType, AttackDetails, AttackError, AttackSeverity, AttackType, OsUuidGenerator, UuidGenerator};
pub use banlist::{BanManager, BanOutcome, BanPolicy};
pub use flow_spec::{FlowSpecAction, FlowSpecActionConfig, FlowSpecRule};
pub use serializers::{describe_attack, join, join_with_prefix};
pub use engine::{CycleReport, DetectionEngine, LogMitigationSink, MitigationError, MitigationSink};
