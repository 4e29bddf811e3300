//! Detection engine for the DDoS mitigation service.
//!
//! Runs the periodic evaluation cycle: resolve each entity to its host
//! group, evaluate its thresholds, create or refresh bans and hand Flow Spec
//! rules to the mitigation sink. A second loop sweeps idle sessions.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time;

use crate::core::attack::{AmplificationAttackType, AttackDetails};
use crate::core::banlist::{BanContext, BanManager, BanOutcome, BanPolicy};
use crate::core::conntrack::ConntrackTable;
use crate::core::counters::{
    Direction, EntitySnapshot, TotalCounterElement, TotalSpeedCounters, TrafficCounters, TrafficSnapshotSupplier,
    TrafficSortOrder, DIRECTION_BUCKETS,
};
use crate::core::flow_spec::{FlowSpecAction, FlowSpecRule};
use crate::core::host_groups::{HostGroupMatch, HostGroupResolver, HostGroupTables, LoadReport, GLOBAL_HOST_GROUP};
use crate::core::network::CidrMask;
use crate::core::serializers::describe_attack;
use crate::core::thresholds::{evaluate, BanSettings, ThresholdBreach, IPPROTO_UDP};
use crate::models::Config;
use crate::utils::get_current_timestamp;

/// Errors reported by a mitigation sink
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MitigationError {
    #[error("announcer rejected rule: {0}")]
    Rejected(String),
    #[error("announcer unavailable: {0}")]
    Unavailable(String),
}

/// Receiver of Flow Spec rules, normally the BGP announcer
#[cfg_attr(test, mockall::automock)]
pub trait MitigationSink: Send + Sync {
    fn announce(&self, rule: &FlowSpecRule) -> Result<(), MitigationError>;
    fn withdraw(&self, rule: &FlowSpecRule) -> Result<(), MitigationError>;
}

/// Sink that only logs the rules it is given
#[derive(Debug, Default)]
pub struct LogMitigationSink;

impl MitigationSink for LogMitigationSink {
    fn announce(&self, rule: &FlowSpecRule) -> Result<(), MitigationError> {
        info!("Flow Spec announce: {}", rule.serialize());
        Ok(())
    }

    fn withdraw(&self, rule: &FlowSpecRule) -> Result<(), MitigationError> {
        info!("Flow Spec withdraw: {}", rule.serialize());
        Ok(())
    }
}

/// Ban settings and policies in effect, per host group
#[derive(Debug, Clone, Default)]
pub struct DetectionPolicies {
    pub global_settings: BanSettings,
    pub global_policy: BanPolicy,
    pub host_group_settings: HashMap<String, BanSettings>,
    pub host_group_policies: HashMap<String, BanPolicy>,
}

impl DetectionPolicies {
    pub fn from_config(config: &Config) -> Self {
        let mut policies = Self {
            global_settings: config.ban_settings.clone(),
            global_policy: config.detection.ban_policy(),
            ..Default::default()
        };

        for group in &config.host_groups {
            if let Some(settings) = &group.ban_settings {
                policies.host_group_settings.insert(group.name.clone(), settings.clone());
            }
            if let Some(policy) = group.ban_policy {
                policies.host_group_policies.insert(group.name.clone(), policy);
            }
        }
        policies
    }

    /// Settings of `host_group`, falling back to the global settings
    pub fn settings_for(&self, host_group: &str) -> &BanSettings {
        self.host_group_settings
            .get(host_group)
            .unwrap_or(&self.global_settings)
    }

    pub fn policy_for(&self, host_group: &str) -> &BanPolicy {
        self.host_group_policies
            .get(host_group)
            .unwrap_or(&self.global_policy)
    }
}

/// Loop timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineIntervals {
    pub evaluation: Duration,
    pub gc: Duration,
    pub conntrack_inactivity_seconds: u64,
}

impl EngineIntervals {
    pub fn from_config(config: &Config) -> Self {
        Self {
            evaluation: Duration::from_secs(config.detection.evaluation_interval_seconds.max(1)),
            gc: Duration::from_secs(config.detection.gc_interval_seconds.max(1)),
            conntrack_inactivity_seconds: config.detection.conntrack_inactivity_seconds,
        }
    }
}

impl Default for EngineIntervals {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Summary of one evaluation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub evaluated: usize,
    pub unmonitored: usize,
    pub breaches: usize,
    /// Breaches seen while banning is disabled for the host group
    pub ban_disabled: usize,
    pub bans_created: usize,
    pub bans_updated: usize,
    /// Active bans whose entity stayed below every threshold this cycle
    pub bans_refreshed: usize,
    pub bans_expired: usize,
    pub announces_retried: usize,
    pub withdrawals_retried: usize,
    pub sink_errors: usize,
}

/// Traffic seen in the last evaluation cycle
#[derive(Debug, Clone, Default)]
struct TrafficView {
    entities: Vec<(CidrMask, TrafficCounters)>,
    totals: TotalSpeedCounters,
    last_cycle: Option<u64>,
}

impl TrafficView {
    /// Replace the entity list and fold host speeds into the totals.
    ///
    /// Subnet snapshots are ranked but left out of the totals, since their
    /// hosts are reported on their own.
    fn update(&mut self, snapshots: &[EntitySnapshot], now: u64) {
        let elapsed = self
            .last_cycle
            .map(|last| now.saturating_sub(last))
            .unwrap_or(0);
        self.last_cycle = Some(now);
        self.entities = snapshots
            .iter()
            .map(|snapshot| (snapshot.entity, snapshot.average))
            .collect();

        let mut speed = [TotalCounterElement::default(); DIRECTION_BUCKETS];
        let mut average = [TotalCounterElement::default(); DIRECTION_BUCKETS];
        for snapshot in snapshots.iter().filter(|snapshot| snapshot.entity.is_host()) {
            for direction in [Direction::Incoming, Direction::Outgoing] {
                add_speed(&mut speed[direction.bucket()], &snapshot.current, direction);
                add_speed(&mut average[direction.bucket()], &snapshot.average, direction);
            }
        }

        for (total, rate) in self.totals.total_counters.iter_mut().zip(speed.iter()) {
            total.bytes = total.bytes.saturating_add(rate.bytes.saturating_mul(elapsed));
            total.packets = total.packets.saturating_add(rate.packets.saturating_mul(elapsed));
            total.flows = total.flows.saturating_add(rate.flows.saturating_mul(elapsed));
        }
        self.totals.total_speed_counters = speed;
        self.totals.total_speed_average_counters = average;
    }
}

fn add_speed(element: &mut TotalCounterElement, counters: &TrafficCounters, direction: Direction) {
    element.bytes = element.bytes.saturating_add(counters.total.bytes(direction));
    element.packets = element.packets.saturating_add(counters.total.packets(direction));
    element.flows = element.flows.saturating_add(counters.flows(direction));
}

/// Periodic detection over aggregator snapshots
pub struct DetectionEngine {
    resolver: HostGroupResolver,
    bans: BanManager,
    conntrack: ConntrackTable,
    policies: RwLock<Arc<DetectionPolicies>>,
    flow_spec_action: FlowSpecAction,
    intervals: EngineIntervals,
    sink: Arc<dyn MitigationSink>,
    /// Rules of lifted bans the announcer has not confirmed withdrawing
    pending_withdrawals: Mutex<Vec<(CidrMask, FlowSpecRule)>>,
    traffic: RwLock<TrafficView>,
}

impl DetectionEngine {
    pub fn new(
        resolver: HostGroupResolver,
        bans: BanManager,
        policies: DetectionPolicies,
        flow_spec_action: FlowSpecAction,
        intervals: EngineIntervals,
        sink: Arc<dyn MitigationSink>,
    ) -> Self {
        Self {
            resolver,
            bans,
            conntrack: ConntrackTable::new(),
            policies: RwLock::new(Arc::new(policies)),
            flow_spec_action,
            intervals,
            sink,
            pending_withdrawals: Mutex::new(Vec::new()),
            traffic: RwLock::new(TrafficView::default()),
        }
    }

    /// Build an engine from configuration; malformed networks are skipped
    /// and listed in the returned report
    pub fn from_config(config: &Config, sink: Arc<dyn MitigationSink>) -> (Self, LoadReport) {
        let (resolver, report) =
            HostGroupResolver::from_config(&config.resolver_host_groups(GLOBAL_HOST_GROUP));
        let engine = Self::new(
            resolver,
            BanManager::new(),
            DetectionPolicies::from_config(config),
            config.detection.flow_spec_action.into(),
            EngineIntervals::from_config(config),
            sink,
        );
        (engine, report)
    }

    /// Swap in new networks and host group settings. Active bans are kept.
    pub fn reload(&self, config: &Config) -> LoadReport {
        let (tables, report) =
            HostGroupTables::from_config(&config.resolver_host_groups(GLOBAL_HOST_GROUP));
        self.resolver.reload(tables);
        *self.policies.write() = Arc::new(DetectionPolicies::from_config(config));
        report
    }

    pub fn resolver(&self) -> &HostGroupResolver {
        &self.resolver
    }

    pub fn bans(&self) -> &BanManager {
        &self.bans
    }

    pub fn conntrack(&self) -> &ConntrackTable {
        &self.conntrack
    }

    pub fn policies(&self) -> Arc<DetectionPolicies> {
        self.policies.read().clone()
    }

    pub fn rule_for(&self, entity: CidrMask, attack: &AttackDetails) -> FlowSpecRule {
        FlowSpecRule::for_attack(entity, attack, self.flow_spec_action)
    }

    /// Withdrawals still waiting for the announcer
    pub fn pending_withdrawals(&self) -> Vec<(CidrMask, FlowSpecRule)> {
        self.pending_withdrawals.lock().clone()
    }

    /// Entities of the last cycle ranked by their average traffic
    pub fn top_entities(&self, order: TrafficSortOrder, limit: usize) -> Vec<(CidrMask, TrafficCounters)> {
        let mut entities = self.traffic.read().entities.clone();
        order.sort(&mut entities);
        entities.truncate(limit);
        entities
    }

    /// Installation-wide speeds of the last cycle and accumulated totals
    pub fn total_traffic(&self) -> TotalSpeedCounters {
        self.traffic.read().totals.clone()
    }

    /// Evaluate one batch of snapshots, then lift expired bans.
    ///
    /// Withdrawals that failed earlier are retried first, so a rule that is
    /// re-announced in this cycle is never withdrawn after the announce.
    pub fn run_cycle(&self, snapshots: &[EntitySnapshot], now: u64) -> CycleReport {
        let mut report = CycleReport::default();
        self.retry_withdrawals(&mut report);

        let tables = self.resolver.snapshot();
        let policies = self.policies();

        for snapshot in snapshots {
            let Some(found) = tables.lookup_best(snapshot.entity.network()) else {
                report.unmonitored += 1;
                continue;
            };
            report.evaluated += 1;
            self.evaluate_entity(snapshot, &found, &policies, now, &mut report);
        }

        for (entity, attack) in self.bans.sweep_expired(now) {
            report.bans_expired += 1;
            self.withdraw(entity, &attack, &mut report);
        }

        self.traffic.write().update(snapshots, now);
        report
    }

    fn evaluate_entity(
        &self,
        snapshot: &EntitySnapshot,
        found: &HostGroupMatch,
        policies: &DetectionPolicies,
        now: u64,
        report: &mut CycleReport,
    ) {
        let entity = snapshot.entity;
        let settings = policies.settings_for(&found.host_group);

        if let Some(breach) = evaluate(&found.host_group, &snapshot.average, settings, entity.is_ipv6()) {
            report.breaches += 1;

            if settings.enable_ban {
                let context = BanContext {
                    host_group: &found.host_group,
                    parent_host_group: found.parent_host_group.as_deref(),
                    customer_network: Some(found.prefix),
                    policy: policies.policy_for(&found.host_group),
                };
                self.ban(entity, &breach, snapshot, &context, now, report);
                return;
            }

            info!(
                "{} exceeds {} threshold of host group {} ({} over {}) but banning is disabled",
                entity,
                breach.threshold_type.name(),
                found.host_group,
                breach.value,
                breach.threshold
            );
            report.ban_disabled += 1;
        }

        // an active ban keeps tracking the entity while it stays below thresholds
        if let Some(attack) = self.bans.refresh(&entity, &snapshot.average) {
            report.bans_refreshed += 1;
            if !attack.mitigation_announced {
                report.announces_retried += 1;
                self.announce(entity, &attack, report);
            }
        }
    }

    fn ban(
        &self,
        entity: CidrMask,
        breach: &ThresholdBreach,
        snapshot: &EntitySnapshot,
        context: &BanContext<'_>,
        now: u64,
        report: &mut CycleReport,
    ) {
        match self.bans.ban(entity, breach, &snapshot.current, &snapshot.average, context, now) {
            BanOutcome::Created { mut attack, .. } => {
                report.bans_created += 1;
                self.classify_amplification(entity, &mut attack);
                info!("Attack on {}:\n{}", entity, describe_attack(&attack));
                self.announce(entity, &attack, report);
            }
            BanOutcome::Updated {
                max_attack_power,
                mitigation_announced,
            } => {
                report.bans_updated += 1;
                debug!("{} still under attack, peak power {}", entity, max_attack_power);
                if !mitigation_announced {
                    if let Some(attack) = self.bans.get(&entity) {
                        report.announces_retried += 1;
                        self.announce(entity, &attack, report);
                    }
                }
            }
        }
    }

    /// Look for a UDP reflector behind an attack on a single host
    fn classify_amplification(&self, entity: CidrMask, attack: &mut AttackDetails) {
        if !entity.is_host()
            || attack.attack_direction != Direction::Incoming
            || !matches!(attack.attack_protocol, 0 | IPPROTO_UDP)
        {
            return;
        }

        let amplification = self.conntrack.classify_amplification(entity.network());
        if amplification != AmplificationAttackType::Unknown {
            info!("Attack on {} looks like {} amplification", entity, amplification.name());
            attack.amplification_attack_type = amplification;
            self.bans.set_amplification_attack_type(&entity, amplification);
        }
    }

    fn announce(&self, entity: CidrMask, attack: &AttackDetails, report: &mut CycleReport) {
        let rule = self.rule_for(entity, attack);
        match self.sink.announce(&rule) {
            Ok(()) => {
                self.bans.set_announced(&entity, true);
                // the same rule is active again
                self.pending_withdrawals
                    .lock()
                    .retain(|(pending, pending_rule)| *pending != entity || *pending_rule != rule);
            }
            Err(e) => {
                error!("Failed to announce mitigation for {}: {}", entity, e);
                metrics::counter!("mitigation_announce_errors_total", 1);
                report.sink_errors += 1;
            }
        }
    }

    fn withdraw(&self, entity: CidrMask, attack: &AttackDetails, report: &mut CycleReport) {
        if !attack.mitigation_announced {
            debug!("No announced rule to withdraw for {}", entity);
            return;
        }
        let rule = self.rule_for(entity, attack);
        if let Err(e) = self.sink.withdraw(&rule) {
            error!("Failed to withdraw mitigation for {}, will retry: {}", entity, e);
            metrics::counter!("mitigation_withdraw_errors_total", 1);
            report.sink_errors += 1;
            self.pending_withdrawals.lock().push((entity, rule));
        }
    }

    fn retry_withdrawals(&self, report: &mut CycleReport) {
        let pending = std::mem::take(&mut *self.pending_withdrawals.lock());
        if pending.is_empty() {
            return;
        }

        let mut failed = Vec::new();
        for (entity, rule) in pending {
            report.withdrawals_retried += 1;
            match self.sink.withdraw(&rule) {
                Ok(()) => info!("Withdrew mitigation for {} on retry", entity),
                Err(e) => {
                    warn!("Withdraw for {} failed again: {}", entity, e);
                    report.sink_errors += 1;
                    failed.push((entity, rule));
                }
            }
        }
        self.pending_withdrawals.lock().extend(failed);
    }

    /// Lift a ban by hand and withdraw its rule.
    ///
    /// The ban is gone even when the withdraw fails; the rule is then queued
    /// and retried by the detection loop.
    pub fn unban(&self, entity: &CidrMask) -> Result<Option<AttackDetails>, MitigationError> {
        let Some(attack) = self.bans.unban(entity) else {
            return Ok(None);
        };
        if !attack.mitigation_announced {
            return Ok(Some(attack));
        }

        let rule = self.rule_for(*entity, &attack);
        if let Err(e) = self.sink.withdraw(&rule) {
            warn!("Withdraw for {} failed, queued for retry: {}", entity, e);
            self.pending_withdrawals.lock().push((*entity, rule));
            return Err(e);
        }
        Ok(Some(attack))
    }

    /// Host group owning `address`, if monitored
    pub fn lookup(&self, address: IpAddr) -> Option<HostGroupMatch> {
        self.resolver.lookup_best(address)
    }

    /// Evaluation loop; runs until the task is dropped
    pub async fn start_detection(&self, supplier: Arc<dyn TrafficSnapshotSupplier>) -> Result<()> {
        info!(
            "Starting detection loop every {}s",
            self.intervals.evaluation.as_secs()
        );
        let mut interval = time::interval(self.intervals.evaluation);

        loop {
            interval.tick().await;
            let snapshots = supplier.snapshots();
            let report = self.run_cycle(&snapshots, get_current_timestamp());
            if report.sink_errors > 0 {
                warn!("Detection cycle finished with {} sink errors", report.sink_errors);
            }
            debug!("Detection cycle: {:?}", report);
        }
    }

    /// Session table sweep loop; runs until the task is dropped
    pub async fn start_conntrack_gc(&self) -> Result<()> {
        info!(
            "Starting conntrack GC every {}s (inactivity window {}s)",
            self.intervals.gc.as_secs(),
            self.intervals.conntrack_inactivity_seconds
        );
        let mut interval = time::interval(self.intervals.gc);

        loop {
            interval.tick().await;
            let evicted = self.conntrack.gc(self.intervals.conntrack_inactivity_seconds);
            debug!(
                "Conntrack GC evicted {} sessions, {} hosts tracked",
                evicted,
                self.conntrack.host_count()
            );
        }
    }

    /// Spawn both background loops
    pub fn start(self: &Arc<Self>, supplier: Arc<dyn TrafficSnapshotSupplier>) -> Vec<JoinHandle<()>> {
        let detection = {
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.start_detection(supplier).await {
                    error!("Detection loop stopped: {}", e);
                }
            })
        };
        let gc = {
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.start_conntrack_gc().await {
                    error!("Conntrack GC loop stopped: {}", e);
                }
            })
        };
        vec![detection, gc]
    }
}

/// Supplier with no traffic, used until an aggregator is attached
#[derive(Debug, Default)]
pub struct NoTraffic;

impl TrafficSnapshotSupplier for NoTraffic {
    fn snapshots(&self) -> Vec<EntitySnapshot> {
        Vec::new()
    }
}
