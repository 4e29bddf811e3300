//! BGP Flow Spec rendering for the DDoS mitigation service.
//!
//! Produces the text form of Flow Spec rules consumed by the external BGP
//! announcer. The action clause is byte-exact: `accept;`, `discard;` or
//! `rate-limit N;`.

use std::fmt;
use serde::{Deserialize, Serialize};

use crate::core::attack::AttackDetails;
use crate::core::network::CidrMask;
use crate::core::serializers::{join, join_with_prefix};
use crate::core::thresholds::{IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};

/// Action applied to traffic matching a Flow Spec rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowSpecAction {
    #[default]
    Accept,
    Discard,
    /// Rate limit in bytes per second
    RateLimit(u64),
}

impl FlowSpecAction {
    pub fn serialize(&self) -> String {
        match self {
            FlowSpecAction::Accept => "accept;".to_string(),
            FlowSpecAction::Discard => "discard;".to_string(),
            FlowSpecAction::RateLimit(rate) => format!("rate-limit {};", rate),
        }
    }
}

impl fmt::Display for FlowSpecAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowSpecActionKind {
    Accept,
    #[default]
    Discard,
    RateLimit,
}

/// Configured mitigation action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlowSpecActionConfig {
    #[serde(default)]
    pub kind: FlowSpecActionKind,
    /// Bytes per second, only used by `rate-limit`
    #[serde(default)]
    pub rate: u64,
}

impl From<FlowSpecActionConfig> for FlowSpecAction {
    fn from(config: FlowSpecActionConfig) -> Self {
        match config.kind {
            FlowSpecActionKind::Accept => FlowSpecAction::Accept,
            FlowSpecActionKind::Discard => FlowSpecAction::Discard,
            FlowSpecActionKind::RateLimit => FlowSpecAction::RateLimit(config.rate),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowSpecProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl FlowSpecProtocol {
    pub fn from_ip_protocol(protocol: u8) -> Option<Self> {
        match protocol {
            IPPROTO_TCP => Some(FlowSpecProtocol::Tcp),
            IPPROTO_UDP => Some(FlowSpecProtocol::Udp),
            IPPROTO_ICMP => Some(FlowSpecProtocol::Icmp),
            _ => None,
        }
    }
}

impl fmt::Display for FlowSpecProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowSpecProtocol::Tcp => "tcp",
            FlowSpecProtocol::Udp => "udp",
            FlowSpecProtocol::Icmp => "icmp",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowSpecFragmentation {
    DontFragment,
    IsFragment,
    FirstFragment,
    LastFragment,
    NotAFragment,
}

impl fmt::Display for FlowSpecFragmentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowSpecFragmentation::DontFragment => "dont-fragment",
            FlowSpecFragmentation::IsFragment => "is-fragment",
            FlowSpecFragmentation::FirstFragment => "first-fragment",
            FlowSpecFragmentation::LastFragment => "last-fragment",
            FlowSpecFragmentation::NotAFragment => "not-a-fragment",
        };
        f.write_str(name)
    }
}

/// A Flow Spec rule: match clause plus action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSpecRule {
    pub destination: Option<CidrMask>,
    pub source: Option<CidrMask>,
    pub protocols: Vec<FlowSpecProtocol>,
    pub source_ports: Vec<u16>,
    pub destination_ports: Vec<u16>,
    pub fragmentation: Vec<FlowSpecFragmentation>,
    pub action: FlowSpecAction,
}

impl FlowSpecRule {
    pub fn new(action: FlowSpecAction) -> Self {
        Self {
            destination: None,
            source: None,
            protocols: Vec::new(),
            source_ports: Vec::new(),
            destination_ports: Vec::new(),
            fragmentation: Vec::new(),
            action,
        }
    }

    /// Rule covering the attacked entity, narrowed to the attack protocol
    /// when the detection was protocol-specific, and to the reflector's UDP
    /// source port for amplification attacks
    pub fn for_attack(destination: CidrMask, attack: &AttackDetails, action: FlowSpecAction) -> Self {
        let mut rule = Self::new(action);
        rule.destination = Some(destination);
        if let Some(protocol) = FlowSpecProtocol::from_ip_protocol(attack.attack_protocol) {
            rule.protocols.push(protocol);
        }
        if let Some(port) = attack.amplification_attack_type.source_port() {
            if !rule.protocols.contains(&FlowSpecProtocol::Udp) {
                rule.protocols.push(FlowSpecProtocol::Udp);
            }
            rule.source_ports.push(port);
        }
        rule
    }

    pub fn is_ipv6(&self) -> bool {
        self.destination
            .or(self.source)
            .map(|prefix| prefix.is_ipv6())
            .unwrap_or(false)
    }

    /// Match clause in announcer syntax, e.g.
    /// `destination 10.0.0.1/32; protocol [ udp ]; destination-port [ =53 ];`
    pub fn serialize_match(&self) -> String {
        let mut clauses = Vec::new();

        if let Some(source) = &self.source {
            clauses.push(format!("source {};", source));
        }
        if let Some(destination) = &self.destination {
            clauses.push(format!("destination {};", destination));
        }
        if !self.protocols.is_empty() {
            clauses.push(format!("protocol [ {} ];", join(&self.protocols, " ")));
        }
        if !self.source_ports.is_empty() {
            clauses.push(format!("source-port [ {} ];", join_with_prefix(&self.source_ports, " ", "=")));
        }
        if !self.destination_ports.is_empty() {
            clauses.push(format!(
                "destination-port [ {} ];",
                join_with_prefix(&self.destination_ports, " ", "=")
            ));
        }
        if !self.fragmentation.is_empty() {
            clauses.push(format!("fragment [ {} ];", join(&self.fragmentation, " ")));
        }

        join(&clauses, " ")
    }

    pub fn serialize(&self) -> String {
        format!(
            "match {{ {} }} then {{ {} }}",
            self.serialize_match(),
            self.action.serialize()
        )
    }
}
