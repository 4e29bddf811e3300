//! Ban lifecycle management for the DDoS mitigation service.
//!
//! Keeps one `AttackDetails` per banned entity. An entity is ABSENT until a
//! threshold breach creates its record, stays ACTIVE while later snapshots
//! only refresh its averages and peak power, and returns to ABSENT when the
//! ban expires or is lifted by hand.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::attack::{AmplificationAttackType, AttackDetails, AttackSeverity, OsUuidGenerator, UuidGenerator};
use crate::core::counters::TrafficCounters;
use crate::core::network::CidrMask;
use crate::core::thresholds::ThresholdBreach;

/// Default ban length in seconds
pub const DEFAULT_BAN_TIME: u64 = 1900;

/// How long bans last
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanPolicy {
    /// Ban length in seconds
    pub ban_time: u64,
    /// Lift bans automatically once `ban_time` has passed
    pub unban_enabled: bool,
}

impl Default for BanPolicy {
    fn default() -> Self {
        Self {
            ban_time: DEFAULT_BAN_TIME,
            unban_enabled: true,
        }
    }
}

/// Where the banned entity sits in the monitored address space
#[derive(Debug, Clone, Copy)]
pub struct BanContext<'a> {
    pub host_group: &'a str,
    pub parent_host_group: Option<&'a str>,
    /// Configured prefix that covers the entity
    pub customer_network: Option<CidrMask>,
    pub policy: &'a BanPolicy,
}

/// Result of reporting a breach to the manager
#[derive(Debug, Clone)]
pub enum BanOutcome {
    /// A new ban was created; holds a copy of the fresh record
    Created {
        attack: Box<AttackDetails>,
        uuid_generated: bool,
    },
    /// The entity was already banned; only the averages and peak moved
    Updated {
        max_attack_power: u64,
        mitigation_announced: bool,
    },
}

impl BanOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, BanOutcome::Created { .. })
    }
}

/// Shared ban list
pub struct BanManager {
    bans: RwLock<HashMap<CidrMask, AttackDetails>>,
    uuid_generator: Box<dyn UuidGenerator>,
}

impl BanManager {
    pub fn new() -> Self {
        Self::with_uuid_generator(Box::new(OsUuidGenerator))
    }

    pub fn with_uuid_generator(uuid_generator: Box<dyn UuidGenerator>) -> Self {
        Self {
            bans: RwLock::new(HashMap::new()),
            uuid_generator,
        }
    }

    /// Ban `entity` for `breach`, or refresh its existing ban.
    ///
    /// `snapshot` is frozen into a new record; `averages` fill its average
    /// fields. An existing ban keeps its direction, threshold type and
    /// initial power, and its peak only follows the metric that created it.
    pub fn ban(
        &self,
        entity: CidrMask,
        breach: &ThresholdBreach,
        snapshot: &TrafficCounters,
        averages: &TrafficCounters,
        context: &BanContext<'_>,
        now: u64,
    ) -> BanOutcome {
        let mut bans = self.bans.write();

        match bans.entry(entity) {
            Entry::Occupied(mut occupied) => {
                let attack = occupied.get_mut();
                let max_attack_power = Self::refresh_record(attack, averages);
                debug!(
                    "Ban for {} already active, peak power {}",
                    entity, max_attack_power
                );
                metrics::counter!("bans_updated_total", 1);
                BanOutcome::Updated {
                    max_attack_power,
                    mitigation_announced: attack.mitigation_announced,
                }
            }
            Entry::Vacant(vacant) => {
                let mut attack = AttackDetails::new(*snapshot, breach.value, now);
                attack.set_averages(averages);
                attack.host_group = context.host_group.to_string();
                attack.parent_host_group = context.parent_host_group.unwrap_or_default().to_string();
                attack.attack_direction = breach.attack_direction();
                attack.attack_protocol = breach.protocol;
                attack.attack_detection_threshold = breach.threshold_type;
                attack.attack_detection_direction = breach.detection_direction;
                attack.ban_time = context.policy.ban_time;
                attack.unban_enabled = context.policy.unban_enabled;
                attack.attack_severity = AttackSeverity::from_power(breach.value, breach.threshold);
                attack.ipv6 = entity.is_ipv6();
                attack.customer_network = context.customer_network;

                let uuid_generated = match attack.generate_uuid(self.uuid_generator.as_ref()) {
                    Ok(_) => true,
                    Err(e) => {
                        warn!("Could not assign attack UUID for {}: {}", entity, e);
                        false
                    }
                };

                info!(
                    "Banned {} ({} {} breach: {} over {}) uuid {}",
                    entity,
                    breach.attack_direction().name(),
                    breach.threshold_type.name(),
                    breach.value,
                    breach.threshold,
                    attack.attack_uuid_as_string()
                );
                metrics::counter!("bans_created_total", 1);

                let attack = vacant.insert(attack).clone();
                BanOutcome::Created {
                    attack: Box::new(attack),
                    uuid_generated,
                }
            }
        }
    }

    /// Refresh the averages of an active ban and raise its peak from the
    /// metric that created it.
    ///
    /// Returns a copy of the refreshed record, or `None` when the entity is
    /// not banned.
    pub fn refresh(&self, entity: &CidrMask, averages: &TrafficCounters) -> Option<AttackDetails> {
        let mut bans = self.bans.write();
        let attack = bans.get_mut(entity)?;
        Self::refresh_record(attack, averages);
        Some(attack.clone())
    }

    fn refresh_record(attack: &mut AttackDetails, averages: &TrafficCounters) -> u64 {
        attack.set_averages(averages);
        match attack.measure_power(averages) {
            Some(power) => attack.update_peak(power),
            None => attack.max_attack_power(),
        }
    }

    /// Record whether the announcer holds the rule of an active ban.
    ///
    /// Returns `false` when the entity is not banned.
    pub fn set_announced(&self, entity: &CidrMask, announced: bool) -> bool {
        match self.bans.write().get_mut(entity) {
            Some(attack) => {
                attack.mitigation_announced = announced;
                true
            }
            None => false,
        }
    }

    pub fn set_amplification_attack_type(&self, entity: &CidrMask, amplification: AmplificationAttackType) -> bool {
        match self.bans.write().get_mut(entity) {
            Some(attack) => {
                attack.amplification_attack_type = amplification;
                true
            }
            None => false,
        }
    }

    /// Remove and return every ban that has expired at `now`
    pub fn sweep_expired(&self, now: u64) -> Vec<(CidrMask, AttackDetails)> {
        let mut expired = Vec::new();
        self.bans.write().retain(|entity, attack| {
            if attack.is_expired(now) {
                expired.push((*entity, attack.clone()));
                false
            } else {
                true
            }
        });

        for (entity, attack) in &expired {
            info!(
                "Ban for {} expired after {} seconds (peak power {})",
                entity,
                now.saturating_sub(attack.ban_timestamp()),
                attack.max_attack_power()
            );
        }
        if !expired.is_empty() {
            metrics::counter!("bans_expired_total", expired.len() as u64);
        }
        expired
    }

    /// Lift a ban regardless of its policy
    pub fn unban(&self, entity: &CidrMask) -> Option<AttackDetails> {
        let removed = self.bans.write().remove(entity);
        if removed.is_some() {
            info!("Ban for {} lifted manually", entity);
        }
        removed
    }

    pub fn get(&self, entity: &CidrMask) -> Option<AttackDetails> {
        self.bans.read().get(entity).cloned()
    }

    /// Copies of all active bans, ordered by entity
    pub fn list(&self) -> Vec<(CidrMask, AttackDetails)> {
        let mut bans: Vec<(CidrMask, AttackDetails)> = self
            .bans
            .read()
            .iter()
            .map(|(entity, attack)| (*entity, attack.clone()))
            .collect();
        bans.sort_by(|a, b| a.0.cmp(&b.0));
        bans
    }

    pub fn is_banned(&self, entity: &CidrMask) -> bool {
        self.bans.read().contains_key(entity)
    }

    pub fn len(&self) -> usize {
        self.bans.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BanManager {
    fn default() -> Self {
        Self::new()
    }
}
