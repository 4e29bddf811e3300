//! Attack records for the DDoS mitigation service.
//!
//! An `AttackDetails` is the materialized state of a detected attack: a
//! frozen copy of the entity's counters at detection time plus everything
//! known about the detection itself.

use std::fmt;
use std::sync::Arc;
use rand::rngs::OsRng;
use rand::TryRngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::counters::{Direction, TrafficCounters};
use crate::core::network::CidrMask;
use crate::core::thresholds::{
    measure, AttackDetectionDirection, AttackDetectionThresholdType, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP,
};

/// Errors that can occur while building attack records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttackError {
    #[error("entropy source unavailable: {0}")]
    EntropyUnavailable(String),
    #[error("attack already has UUID {0}")]
    UuidAlreadySet(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackSeverity {
    Low,
    #[default]
    Middle,
    High,
}

impl AttackSeverity {
    /// Severity from how far the detection value exceeded its threshold:
    /// under twice the threshold is low, ten times or more is high.
    pub fn from_power(value: u64, threshold: u32) -> Self {
        let threshold = u64::from(threshold.max(1));
        if value >= threshold.saturating_mul(10) {
            AttackSeverity::High
        } else if value >= threshold.saturating_mul(2) {
            AttackSeverity::Middle
        } else {
            AttackSeverity::Low
        }
    }
}

/// How the attack was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackDetectionSource {
    #[default]
    Automatic,
    Manual,
    Other,
}

/// Attack classification derived from the frozen counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackType {
    Unknown,
    SynFlood,
    IcmpFlood,
    UdpFlood,
    IpFragmentationFlood,
}

impl AttackType {
    pub fn name(&self) -> &'static str {
        match self {
            AttackType::Unknown => "unknown",
            AttackType::SynFlood => "syn_flood",
            AttackType::IcmpFlood => "icmp_flood",
            AttackType::UdpFlood => "udp_flood",
            AttackType::IpFragmentationFlood => "ip_fragmentation",
        }
    }
}

/// Share of the attack-direction packets one protocol needs to name the attack
const ATTACK_TYPE_SHARE: f64 = 0.7;

/// UDP reflection service abused by an amplification attack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmplificationAttackType {
    #[default]
    Unknown,
    Dns,
    Ntp,
    Ssdp,
    Snmp,
    Chargen,
}

impl AmplificationAttackType {
    /// Reflector type by the UDP source port of the attack traffic
    pub fn from_source_port(port: u16) -> Self {
        match port {
            53 => AmplificationAttackType::Dns,
            123 => AmplificationAttackType::Ntp,
            1900 => AmplificationAttackType::Ssdp,
            161 => AmplificationAttackType::Snmp,
            19 => AmplificationAttackType::Chargen,
            _ => AmplificationAttackType::Unknown,
        }
    }

    pub fn source_port(&self) -> Option<u16> {
        match self {
            AmplificationAttackType::Unknown => None,
            AmplificationAttackType::Dns => Some(53),
            AmplificationAttackType::Ntp => Some(123),
            AmplificationAttackType::Ssdp => Some(1900),
            AmplificationAttackType::Snmp => Some(161),
            AmplificationAttackType::Chargen => Some(19),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AmplificationAttackType::Unknown => "unknown",
            AmplificationAttackType::Dns => "dns",
            AmplificationAttackType::Ntp => "ntp",
            AmplificationAttackType::Ssdp => "ssdp",
            AmplificationAttackType::Snmp => "snmp",
            AmplificationAttackType::Chargen => "chargen",
        }
    }
}

/// Raw packet capture attached to an attack; owned by the capture subsystem
pub trait PacketCapture: fmt::Debug + Send + Sync {
    fn packet_count(&self) -> usize;
}

/// Source of attack UUIDs
pub trait UuidGenerator: Send + Sync {
    fn generate(&self) -> Result<Uuid, AttackError>;
}

/// Random (v4) UUIDs from the operating system RNG.
///
/// Reading the OS RNG can fail when the entropy pool is exhausted; that is
/// reported as an error instead of a panic.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsUuidGenerator;

impl UuidGenerator for OsUuidGenerator {
    fn generate(&self) -> Result<Uuid, AttackError> {
        let mut bytes = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| AttackError::EntropyUnavailable(e.to_string()))?;
        Ok(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }
}

/// Ban record for one attacked entity
#[derive(Debug, Clone, Serialize)]
pub struct AttackDetails {
    /// Counters frozen at detection time
    pub traffic: TrafficCounters,

    pub host_group: String,
    pub parent_host_group: String,

    pub attack_direction: Direction,

    /// Value of the breached metric at detection
    pub attack_power: u64,
    max_attack_power: u64,
    pub attack_protocol: u8,

    pub average_in_bytes: u64,
    pub average_out_bytes: u64,
    pub average_in_packets: u64,
    pub average_out_packets: u64,
    pub average_in_flows: u64,
    pub average_out_flows: u64,

    ban_timestamp: u64,
    pub unban_enabled: bool,
    /// Ban length in seconds
    pub ban_time: u64,

    pub ipv6: bool,
    pub customer_network: Option<CidrMask>,

    pub attack_detection_source: AttackDetectionSource,
    attack_uuid: Uuid,
    pub attack_severity: AttackSeverity,

    pub attack_detection_threshold: AttackDetectionThresholdType,
    pub attack_detection_direction: AttackDetectionDirection,

    pub amplification_attack_type: AmplificationAttackType,
    /// Whether the announcer has accepted the Flow Spec rule for this ban
    pub mitigation_announced: bool,

    #[serde(skip)]
    pub pcap_attack_dump: Option<Arc<dyn PacketCapture>>,
}

impl Default for AttackDetails {
    fn default() -> Self {
        Self {
            traffic: TrafficCounters::default(),
            host_group: String::new(),
            parent_host_group: String::new(),
            attack_direction: Direction::Other,
            attack_power: 0,
            max_attack_power: 0,
            attack_protocol: 0,
            average_in_bytes: 0,
            average_out_bytes: 0,
            average_in_packets: 0,
            average_out_packets: 0,
            average_in_flows: 0,
            average_out_flows: 0,
            ban_timestamp: 0,
            unban_enabled: true,
            ban_time: 0,
            ipv6: false,
            customer_network: None,
            attack_detection_source: AttackDetectionSource::Automatic,
            attack_uuid: Uuid::nil(),
            attack_severity: AttackSeverity::Middle,
            attack_detection_threshold: AttackDetectionThresholdType::Unknown,
            attack_detection_direction: AttackDetectionDirection::Unknown,
            amplification_attack_type: AmplificationAttackType::Unknown,
            mitigation_announced: false,
            pcap_attack_dump: None,
        }
    }
}

impl AttackDetails {
    /// Fresh record banned at `ban_timestamp` with initial power `attack_power`
    pub fn new(traffic: TrafficCounters, attack_power: u64, ban_timestamp: u64) -> Self {
        Self {
            traffic,
            attack_power,
            max_attack_power: attack_power,
            ban_timestamp,
            ..Default::default()
        }
    }

    pub fn ban_timestamp(&self) -> u64 {
        self.ban_timestamp
    }

    pub fn max_attack_power(&self) -> u64 {
        self.max_attack_power
    }

    /// Raise the peak power; lower values are ignored
    pub fn update_peak(&mut self, attack_power: u64) -> u64 {
        self.max_attack_power = self.max_attack_power.max(attack_power);
        self.max_attack_power
    }

    /// Value of the detecting dimension in `counters`, in the same unit as
    /// `attack_power`
    pub fn measure_power(&self, counters: &TrafficCounters) -> Option<u64> {
        measure(
            counters,
            self.attack_detection_threshold,
            self.attack_detection_direction,
        )
    }

    /// Copy the average speed fields from an average snapshot
    pub fn set_averages(&mut self, average: &TrafficCounters) {
        self.average_in_bytes = average.total.in_bytes;
        self.average_out_bytes = average.total.out_bytes;
        self.average_in_packets = average.total.in_packets;
        self.average_out_packets = average.total.out_packets;
        self.average_in_flows = average.in_flows;
        self.average_out_flows = average.out_flows;
    }

    pub fn attack_uuid(&self) -> Option<Uuid> {
        if self.attack_uuid.is_nil() {
            None
        } else {
            Some(self.attack_uuid)
        }
    }

    pub fn attack_uuid_as_string(&self) -> String {
        self.attack_uuid.to_string()
    }

    /// Assign a UUID if none is set yet.
    ///
    /// On failure the record keeps its nil UUID and stays fully usable.
    pub fn generate_uuid(&mut self, generator: &dyn UuidGenerator) -> Result<Uuid, AttackError> {
        if !self.attack_uuid.is_nil() {
            return Err(AttackError::UuidAlreadySet(self.attack_uuid));
        }
        let uuid = generator.generate()?;
        self.attack_uuid = uuid;
        Ok(uuid)
    }

    pub fn protocol_name(&self) -> &'static str {
        if self.ipv6 {
            "IPv6"
        } else {
            "IPv4"
        }
    }

    /// Whether the ban is due to be lifted at `now`
    pub fn is_expired(&self, now: u64) -> bool {
        self.unban_enabled && now.saturating_sub(self.ban_timestamp) >= self.ban_time
    }

    /// Classify the attack from the protocol mix in the attack direction
    pub fn classify(&self) -> AttackType {
        let direction = self.attack_direction;
        if !matches!(direction, Direction::Incoming | Direction::Outgoing) {
            return AttackType::Unknown;
        }

        let total = self.traffic.total.packets(direction) as f64;
        let dominates = |packets: u64| packets as f64 > total * ATTACK_TYPE_SHARE;

        if dominates(self.traffic.tcp_syn.packets(direction)) {
            AttackType::SynFlood
        } else if dominates(self.traffic.icmp.packets(direction)) {
            AttackType::IcmpFlood
        } else if dominates(self.traffic.fragmented.packets(direction)) {
            AttackType::IpFragmentationFlood
        } else if dominates(self.traffic.udp.packets(direction)) {
            AttackType::UdpFlood
        } else {
            AttackType::Unknown
        }
    }
}

/// Printable name of an IP protocol number
pub fn protocol_name_by_number(protocol: u8) -> &'static str {
    match protocol {
        IPPROTO_TCP => "tcp",
        IPPROTO_UDP => "udp",
        IPPROTO_ICMP => "icmp",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ExhaustedEntropy;

    impl UuidGenerator for ExhaustedEntropy {
        fn generate(&self) -> Result<Uuid, AttackError> {
            Err(AttackError::EntropyUnavailable("pool empty".to_string()))
        }
    }

    #[test]
    fn test_default_record() {
        let attack = AttackDetails::default();
        assert_eq!(attack.attack_direction, Direction::Other);
        assert!(attack.unban_enabled);
        assert_eq!(attack.attack_severity, AttackSeverity::Middle);
        assert_eq!(attack.attack_detection_source, AttackDetectionSource::Automatic);
        assert_eq!(attack.attack_uuid(), None);
        assert_eq!(attack.attack_uuid_as_string(), "00000000-0000-0000-0000-000000000000");
        assert_eq!(attack.protocol_name(), "IPv4");
        assert_eq!(attack.classify(), AttackType::Unknown);
    }

    #[test]
    fn test_generate_uuid_once() {
        let mut attack = AttackDetails::default();
        let uuid = attack.generate_uuid(&OsUuidGenerator).unwrap();
        assert_eq!(uuid.get_version_num(), 4);
        assert_eq!(attack.attack_uuid(), Some(uuid));

        assert_eq!(
            attack.generate_uuid(&OsUuidGenerator),
            Err(AttackError::UuidAlreadySet(uuid))
        );
        assert_eq!(attack.attack_uuid(), Some(uuid));
    }

    #[test]
    fn test_generate_uuid_failure_keeps_nil() {
        let mut attack = AttackDetails::default();
        assert!(matches!(
            attack.generate_uuid(&ExhaustedEntropy),
            Err(AttackError::EntropyUnavailable(_))
        ));
        assert_eq!(attack.attack_uuid(), None);

        // a later retry can still succeed
        assert!(attack.generate_uuid(&OsUuidGenerator).is_ok());
    }

    #[test]
    fn test_peak_never_decreases() {
        let mut attack = AttackDetails::new(TrafficCounters::default(), 500, 10);
        assert_eq!(attack.max_attack_power(), 500);

        let mut previous = attack.max_attack_power();
        for power in [100, 800, 300, 800, 1200, 0] {
            let peak = attack.update_peak(power);
            assert!(peak >= previous);
            assert!(peak >= attack.attack_power);
            previous = peak;
        }
        assert_eq!(attack.max_attack_power(), 1200);
        assert_eq!(attack.attack_power, 500);
    }

    #[test]
    fn test_expiry() {
        let mut attack = AttackDetails::new(TrafficCounters::default(), 1, 1000);
        attack.ban_time = 60;
        assert!(!attack.is_expired(1059));
        assert!(attack.is_expired(1060));

        attack.unban_enabled = false;
        assert!(!attack.is_expired(1_000_000));
    }

    #[test]
    fn test_classify_syn_flood() {
        let mut attack = AttackDetails::default();
        attack.attack_direction = Direction::Incoming;
        attack.traffic.total.in_packets = 1000;
        attack.traffic.tcp.in_packets = 950;
        attack.traffic.tcp_syn.in_packets = 900;
        assert_eq!(attack.classify(), AttackType::SynFlood);
    }

    #[test]
    fn test_classify_outgoing_udp_flood() {
        let mut attack = AttackDetails::default();
        attack.attack_direction = Direction::Outgoing;
        attack.traffic.total.out_packets = 1000;
        attack.traffic.udp.out_packets = 710;
        assert_eq!(attack.classify(), AttackType::UdpFlood);

        attack.traffic.udp.out_packets = 600;
        assert_eq!(attack.classify(), AttackType::Unknown);
    }

    #[test]
    fn test_measure_power_follows_detection_dimension() {
        let mut attack = AttackDetails::default();
        let mut counters = TrafficCounters::default();
        counters.total.in_packets = 900;
        counters.total.in_bytes = 1000 * 1024 * 1024;
        assert_eq!(attack.measure_power(&counters), None);

        attack.attack_detection_threshold = AttackDetectionThresholdType::PacketsPerSecond;
        attack.attack_detection_direction = AttackDetectionDirection::Incoming;
        assert_eq!(attack.measure_power(&counters), Some(900));

        attack.attack_detection_threshold = AttackDetectionThresholdType::BytesPerSecond;
        assert_eq!(attack.measure_power(&counters), Some(8000));
    }

    #[test]
    fn test_severity_from_power() {
        assert_eq!(AttackSeverity::from_power(1001, 1000), AttackSeverity::Low);
        assert_eq!(AttackSeverity::from_power(2000, 1000), AttackSeverity::Middle);
        assert_eq!(AttackSeverity::from_power(9999, 1000), AttackSeverity::Middle);
        assert_eq!(AttackSeverity::from_power(10_000, 1000), AttackSeverity::High);
        assert_eq!(AttackSeverity::from_power(10, 0), AttackSeverity::High);
        assert_eq!(AttackSeverity::from_power(u64::MAX, u32::MAX), AttackSeverity::High);
    }

    #[test]
    fn test_amplification_ports() {
        for (port, kind) in [
            (53, AmplificationAttackType::Dns),
            (123, AmplificationAttackType::Ntp),
            (1900, AmplificationAttackType::Ssdp),
            (161, AmplificationAttackType::Snmp),
            (19, AmplificationAttackType::Chargen),
        ] {
            assert_eq!(AmplificationAttackType::from_source_port(port), kind);
            assert_eq!(kind.source_port(), Some(port));
        }
        assert_eq!(AmplificationAttackType::from_source_port(443), AmplificationAttackType::Unknown);
        assert_eq!(AmplificationAttackType::Unknown.source_port(), None);
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!(protocol_name_by_number(6), "tcp");
        assert_eq!(protocol_name_by_number(17), "udp");
        assert_eq!(protocol_name_by_number(1), "icmp");
        assert_eq!(protocol_name_by_number(0), "unknown");
    }
}
