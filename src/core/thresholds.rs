//! Threshold evaluation for the DDoS mitigation service.
//!
//! Compares a traffic snapshot against the ban settings of its host group
//! and reports the first breached dimension in a fixed priority order.

use serde::{Deserialize, Serialize};

use crate::core::counters::{Direction, TrafficCounters, TrafficElement};
use crate::utils::convert_speed_to_mbps;

/// Ban thresholds for one host group or the global default.
///
/// The default value disables everything, which never bans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanSettings {
    pub enable_ban: bool,
    pub enable_ban_ipv6: bool,

    pub enable_ban_for_pps: bool,
    pub enable_ban_for_bandwidth: bool,
    pub enable_ban_for_flows_per_second: bool,

    pub enable_ban_for_tcp_pps: bool,
    pub enable_ban_for_tcp_bandwidth: bool,

    pub enable_ban_for_udp_pps: bool,
    pub enable_ban_for_udp_bandwidth: bool,

    pub enable_ban_for_icmp_pps: bool,
    pub enable_ban_for_icmp_bandwidth: bool,

    pub enable_ban_for_tcp_syn_pps: bool,
    pub enable_ban_for_tcp_syn_bandwidth: bool,

    pub ban_threshold_tcp_mbps: u32,
    pub ban_threshold_tcp_pps: u32,

    pub ban_threshold_udp_mbps: u32,
    pub ban_threshold_udp_pps: u32,

    pub ban_threshold_icmp_mbps: u32,
    pub ban_threshold_icmp_pps: u32,

    pub ban_threshold_tcp_syn_mbps: u32,
    pub ban_threshold_tcp_syn_pps: u32,

    pub ban_threshold_mbps: u32,
    pub ban_threshold_flows: u32,
    pub ban_threshold_pps: u32,
}

/// Which threshold detected an attack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackDetectionThresholdType {
    #[default]
    Unknown,

    PacketsPerSecond,
    BytesPerSecond,
    FlowsPerSecond,

    TcpPacketsPerSecond,
    UdpPacketsPerSecond,
    IcmpPacketsPerSecond,

    TcpBytesPerSecond,
    UdpBytesPerSecond,
    IcmpBytesPerSecond,

    TcpSynPacketsPerSecond,
    TcpSynBytesPerSecond,
}

impl AttackDetectionThresholdType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::PacketsPerSecond => "packets_per_second",
            Self::BytesPerSecond => "bytes_per_second",
            Self::FlowsPerSecond => "flows_per_second",
            Self::TcpPacketsPerSecond => "tcp_packets_per_second",
            Self::UdpPacketsPerSecond => "udp_packets_per_second",
            Self::IcmpPacketsPerSecond => "icmp_packets_per_second",
            Self::TcpBytesPerSecond => "tcp_bytes_per_second",
            Self::UdpBytesPerSecond => "udp_bytes_per_second",
            Self::IcmpBytesPerSecond => "icmp_bytes_per_second",
            Self::TcpSynPacketsPerSecond => "tcp_syn_packets_per_second",
            Self::TcpSynBytesPerSecond => "tcp_syn_bytes_per_second",
        }
    }
}

/// Which traffic direction crossed the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackDetectionDirection {
    #[default]
    Unknown,
    Incoming,
    Outgoing,
}

impl From<AttackDetectionDirection> for Direction {
    fn from(value: AttackDetectionDirection) -> Self {
        match value {
            AttackDetectionDirection::Incoming => Direction::Incoming,
            AttackDetectionDirection::Outgoing => Direction::Outgoing,
            AttackDetectionDirection::Unknown => Direction::Other,
        }
    }
}

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// First breached dimension of an evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThresholdBreach {
    pub host_group: String,
    pub threshold_type: AttackDetectionThresholdType,
    pub detection_direction: AttackDetectionDirection,
    /// Live value of the breached metric (pps, mbps or flows per second)
    pub value: u64,
    pub threshold: u32,
    /// IP protocol number of protocol-specific thresholds, 0 otherwise
    pub protocol: u8,
}

impl ThresholdBreach {
    pub fn attack_direction(&self) -> Direction {
        self.detection_direction.into()
    }
}

#[derive(Clone, Copy)]
enum Metric {
    Packets,
    Mbps,
    Flows,
}

struct Dimension {
    enabled: bool,
    threshold: u32,
    threshold_type: AttackDetectionThresholdType,
    metric: Metric,
    protocol: u8,
    element: fn(&TrafficCounters) -> &TrafficElement,
}

impl Dimension {
    fn new(
        enabled: bool,
        threshold: u32,
        threshold_type: AttackDetectionThresholdType,
        metric: Metric,
        protocol: u8,
        element: fn(&TrafficCounters) -> &TrafficElement,
    ) -> Self {
        Self {
            enabled,
            threshold,
            threshold_type,
            metric,
            protocol,
            element,
        }
    }

    fn value(&self, snapshot: &TrafficCounters, direction: Direction) -> u64 {
        match self.metric {
            Metric::Packets => (self.element)(snapshot).packets(direction),
            Metric::Mbps => convert_speed_to_mbps((self.element)(snapshot).bytes(direction)),
            Metric::Flows => snapshot.flows(direction),
        }
    }
}

fn dimensions(settings: &BanSettings) -> [Dimension; 11] {
    use AttackDetectionThresholdType as T;

    let dimension = Dimension::new;

    [
        dimension(settings.enable_ban_for_pps, settings.ban_threshold_pps, T::PacketsPerSecond, Metric::Packets, 0, |c| &c.total),
        dimension(settings.enable_ban_for_bandwidth, settings.ban_threshold_mbps, T::BytesPerSecond, Metric::Mbps, 0, |c| &c.total),
        dimension(settings.enable_ban_for_flows_per_second, settings.ban_threshold_flows, T::FlowsPerSecond, Metric::Flows, 0, |c| &c.total),
        dimension(settings.enable_ban_for_tcp_pps, settings.ban_threshold_tcp_pps, T::TcpPacketsPerSecond, Metric::Packets, IPPROTO_TCP, |c| &c.tcp),
        dimension(settings.enable_ban_for_udp_pps, settings.ban_threshold_udp_pps, T::UdpPacketsPerSecond, Metric::Packets, IPPROTO_UDP, |c| &c.udp),
        dimension(settings.enable_ban_for_icmp_pps, settings.ban_threshold_icmp_pps, T::IcmpPacketsPerSecond, Metric::Packets, IPPROTO_ICMP, |c| &c.icmp),
        dimension(settings.enable_ban_for_tcp_bandwidth, settings.ban_threshold_tcp_mbps, T::TcpBytesPerSecond, Metric::Mbps, IPPROTO_TCP, |c| &c.tcp),
        dimension(settings.enable_ban_for_udp_bandwidth, settings.ban_threshold_udp_mbps, T::UdpBytesPerSecond, Metric::Mbps, IPPROTO_UDP, |c| &c.udp),
        dimension(settings.enable_ban_for_icmp_bandwidth, settings.ban_threshold_icmp_mbps, T::IcmpBytesPerSecond, Metric::Mbps, IPPROTO_ICMP, |c| &c.icmp),
        dimension(settings.enable_ban_for_tcp_syn_pps, settings.ban_threshold_tcp_syn_pps, T::TcpSynPacketsPerSecond, Metric::Packets, IPPROTO_TCP, |c| &c.tcp_syn),
        dimension(settings.enable_ban_for_tcp_syn_bandwidth, settings.ban_threshold_tcp_syn_mbps, T::TcpSynBytesPerSecond, Metric::Mbps, IPPROTO_TCP, |c| &c.tcp_syn),
    ]
}

/// Check `snapshot` against `settings`.
///
/// Dimensions are tried in priority order (aggregate pps, bandwidth, flows,
/// per-protocol pps, per-protocol bandwidth, SYN pps, SYN bandwidth), incoming
/// before outgoing. A value has to be strictly above its threshold. IPv6
/// snapshots are only looked at when `enable_ban_ipv6` is set.
pub fn evaluate(
    host_group: &str,
    snapshot: &TrafficCounters,
    settings: &BanSettings,
    ipv6: bool,
) -> Option<ThresholdBreach> {
    if ipv6 && !settings.enable_ban_ipv6 {
        return None;
    }

    for dimension in dimensions(settings).iter().filter(|d| d.enabled) {
        for (direction, detection_direction) in [
            (Direction::Incoming, AttackDetectionDirection::Incoming),
            (Direction::Outgoing, AttackDetectionDirection::Outgoing),
        ] {
            let value = dimension.value(snapshot, direction);
            if value > u64::from(dimension.threshold) {
                return Some(ThresholdBreach {
                    host_group: host_group.to_string(),
                    threshold_type: dimension.threshold_type,
                    detection_direction,
                    value,
                    threshold: dimension.threshold,
                    protocol: dimension.protocol,
                });
            }
        }
    }

    None
}

/// Current value of one dimension, in that dimension's own unit.
///
/// `None` for `Unknown` threshold types or directions.
pub fn measure(
    snapshot: &TrafficCounters,
    threshold_type: AttackDetectionThresholdType,
    detection_direction: AttackDetectionDirection,
) -> Option<u64> {
    if detection_direction == AttackDetectionDirection::Unknown {
        return None;
    }
    dimensions(&BanSettings::default())
        .iter()
        .find(|dimension| dimension.threshold_type == threshold_type)
        .map(|dimension| dimension.value(snapshot, detection_direction.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> TrafficCounters {
        TrafficCounters::default()
    }

    #[test]
    fn test_default_settings_never_breach() {
        let mut counters = snapshot();
        counters.total.in_packets = u64::MAX;
        counters.in_flows = u64::MAX;
        assert_eq!(evaluate("global", &counters, &BanSettings::default(), false), None);
    }

    #[test]
    fn test_pps_breach_incoming() {
        let settings = BanSettings {
            enable_ban_for_pps: true,
            ban_threshold_pps: 1000,
            ..Default::default()
        };
        let mut counters = snapshot();
        counters.total.in_packets = 1000;
        assert_eq!(evaluate("global", &counters, &settings, false), None);

        counters.total.in_packets = 1001;
        let breach = evaluate("global", &counters, &settings, false).unwrap();
        assert_eq!(breach.threshold_type, AttackDetectionThresholdType::PacketsPerSecond);
        assert_eq!(breach.detection_direction, AttackDetectionDirection::Incoming);
        assert_eq!(breach.value, 1001);
        assert_eq!(breach.protocol, 0);
        assert_eq!(breach.host_group, "global");
        assert_eq!(breach.attack_direction(), Direction::Incoming);
    }

    #[test]
    fn test_outgoing_breach_detected() {
        let settings = BanSettings {
            enable_ban_for_flows_per_second: true,
            ban_threshold_flows: 10,
            ..Default::default()
        };
        let mut counters = snapshot();
        counters.out_flows = 11;
        let breach = evaluate("hosting", &counters, &settings, false).unwrap();
        assert_eq!(breach.threshold_type, AttackDetectionThresholdType::FlowsPerSecond);
        assert_eq!(breach.detection_direction, AttackDetectionDirection::Outgoing);
    }

    #[test]
    fn test_priority_prefers_aggregate_over_protocol() {
        let settings = BanSettings {
            enable_ban_for_pps: true,
            ban_threshold_pps: 100,
            enable_ban_for_udp_pps: true,
            ban_threshold_udp_pps: 50,
            enable_ban_for_bandwidth: true,
            ban_threshold_mbps: 1,
            ..Default::default()
        };
        let mut counters = snapshot();
        counters.total.out_packets = 500;
        counters.total.in_bytes = 10 * 1024 * 1024;
        counters.udp.in_packets = 500;

        // outgoing pps comes before incoming bandwidth
        let breach = evaluate("global", &counters, &settings, false).unwrap();
        assert_eq!(breach.threshold_type, AttackDetectionThresholdType::PacketsPerSecond);
        assert_eq!(breach.detection_direction, AttackDetectionDirection::Outgoing);

        counters.total.out_packets = 0;
        let breach = evaluate("global", &counters, &settings, false).unwrap();
        assert_eq!(breach.threshold_type, AttackDetectionThresholdType::BytesPerSecond);
        assert_eq!(breach.value, 80);

        counters.total.in_bytes = 0;
        let breach = evaluate("global", &counters, &settings, false).unwrap();
        assert_eq!(breach.threshold_type, AttackDetectionThresholdType::UdpPacketsPerSecond);
        assert_eq!(breach.protocol, IPPROTO_UDP);
    }

    #[test]
    fn test_protocol_pps_before_protocol_bandwidth() {
        let settings = BanSettings {
            enable_ban_for_icmp_pps: true,
            ban_threshold_icmp_pps: 10,
            enable_ban_for_tcp_bandwidth: true,
            ban_threshold_tcp_mbps: 1,
            ..Default::default()
        };
        let mut counters = snapshot();
        counters.tcp.in_bytes = 100 * 1024 * 1024;
        counters.icmp.in_packets = 11;

        let breach = evaluate("global", &counters, &settings, false).unwrap();
        assert_eq!(breach.threshold_type, AttackDetectionThresholdType::IcmpPacketsPerSecond);
        assert_eq!(breach.protocol, IPPROTO_ICMP);
    }

    #[test]
    fn test_syn_thresholds_are_last() {
        let settings = BanSettings {
            enable_ban_for_tcp_syn_pps: true,
            ban_threshold_tcp_syn_pps: 100,
            enable_ban_for_tcp_syn_bandwidth: true,
            ban_threshold_tcp_syn_mbps: 1,
            ..Default::default()
        };
        let mut counters = snapshot();
        counters.tcp_syn.in_bytes = 1024 * 1024;
        let breach = evaluate("global", &counters, &settings, false).unwrap();
        assert_eq!(breach.threshold_type, AttackDetectionThresholdType::TcpSynBytesPerSecond);

        counters.tcp_syn.in_packets = 101;
        let breach = evaluate("global", &counters, &settings, false).unwrap();
        assert_eq!(breach.threshold_type, AttackDetectionThresholdType::TcpSynPacketsPerSecond);
        assert_eq!(breach.protocol, IPPROTO_TCP);
    }

    #[test]
    fn test_ipv6_requires_its_own_flag() {
        let mut settings = BanSettings {
            enable_ban_for_pps: true,
            ban_threshold_pps: 1,
            ..Default::default()
        };
        let mut counters = snapshot();
        counters.total.in_packets = 100;

        assert!(evaluate("global", &counters, &settings, false).is_some());
        assert!(evaluate("global", &counters, &settings, true).is_none());

        settings.enable_ban_ipv6 = true;
        assert!(evaluate("global", &counters, &settings, true).is_some());
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let settings: BanSettings =
            serde_json::from_str(r#"{"enable_ban": true, "ban_threshold_pps": 20000}"#).unwrap();
        assert!(settings.enable_ban);
        assert!(!settings.enable_ban_for_pps);
        assert_eq!(settings.ban_threshold_pps, 20000);
    }

    #[test]
    fn test_measure_uses_the_dimension_unit() {
        let mut counters = snapshot();
        counters.total.in_packets = 500;
        counters.total.in_bytes = 1000 * 1024 * 1024;
        counters.udp.out_packets = 42;
        counters.out_flows = 7;

        let measured = |threshold_type, direction| measure(&counters, threshold_type, direction);
        assert_eq!(
            measured(AttackDetectionThresholdType::PacketsPerSecond, AttackDetectionDirection::Incoming),
            Some(500)
        );
        assert_eq!(
            measured(AttackDetectionThresholdType::BytesPerSecond, AttackDetectionDirection::Incoming),
            Some(8000)
        );
        assert_eq!(
            measured(AttackDetectionThresholdType::UdpPacketsPerSecond, AttackDetectionDirection::Outgoing),
            Some(42)
        );
        assert_eq!(
            measured(AttackDetectionThresholdType::FlowsPerSecond, AttackDetectionDirection::Outgoing),
            Some(7)
        );
        assert_eq!(
            measured(AttackDetectionThresholdType::Unknown, AttackDetectionDirection::Incoming),
            None
        );
        assert_eq!(
            measured(AttackDetectionThresholdType::PacketsPerSecond, AttackDetectionDirection::Unknown),
            None
        );
    }
}
