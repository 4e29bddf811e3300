//! Traffic counter snapshots consumed by the detection core.
//!
//! Counters are produced by the external aggregator. The core only reads
//! them, and freezes a copy into each ban record at detection time.

use std::cmp::Ordering;
use std::net::IpAddr;
use serde::{Deserialize, Serialize};

use crate::core::network::CidrMask;

/// Direction of traffic relative to the monitored networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
    Internal,
    #[default]
    Other,
}

impl Direction {
    pub fn name(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
            Direction::Internal => "internal",
            Direction::Other => "other",
        }
    }

    /// Slot of this direction in the total speed counter arrays
    pub fn bucket(&self) -> usize {
        match self {
            Direction::Incoming => 0,
            Direction::Outgoing => 1,
            Direction::Other => 2,
            Direction::Internal => 3,
        }
    }
}

/// Byte and packet counts for both directions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficElement {
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub in_packets: u64,
    pub out_packets: u64,
}

impl TrafficElement {
    pub fn bytes(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Incoming => self.in_bytes,
            Direction::Outgoing => self.out_bytes,
            _ => 0,
        }
    }

    pub fn packets(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Incoming => self.in_packets,
            Direction::Outgoing => self.out_packets,
            _ => 0,
        }
    }
}

/// Per-entity traffic counters (speed values, per second)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficCounters {
    pub total: TrafficElement,
    pub fragmented: TrafficElement,
    pub tcp: TrafficElement,
    pub tcp_syn: TrafficElement,
    pub udp: TrafficElement,
    pub icmp: TrafficElement,
    pub in_flows: u64,
    pub out_flows: u64,
}

impl TrafficCounters {
    pub fn flows(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Incoming => self.in_flows,
            Direction::Outgoing => self.out_flows,
            _ => 0,
        }
    }
}

/// Counters for one entity as handed over by the aggregator.
///
/// The entity is a single host (/32 or /128) or a whole subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySnapshot {
    pub entity: CidrMask,
    /// Speed over the last measurement interval
    pub current: TrafficCounters,
    /// Smoothed average speed
    pub average: TrafficCounters,
}

impl EntitySnapshot {
    pub fn host(address: IpAddr, current: TrafficCounters, average: TrafficCounters) -> Self {
        Self {
            entity: CidrMask::host(address),
            current,
            average,
        }
    }
}

/// Source of per-entity counter snapshots (the external aggregator)
pub trait TrafficSnapshotSupplier: Send + Sync {
    fn snapshots(&self) -> Vec<EntitySnapshot>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalCounterElement {
    pub bytes: u64,
    pub packets: u64,
    pub flows: u64,
}

impl TotalCounterElement {
    pub fn zeroify(&mut self) {
        *self = Self::default();
    }
}

pub const DIRECTION_BUCKETS: usize = 4;

/// Whole-installation counters, one slot per direction bucket
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalSpeedCounters {
    pub total_counters: [TotalCounterElement; DIRECTION_BUCKETS],
    pub total_speed_counters: [TotalCounterElement; DIRECTION_BUCKETS],
    pub total_speed_average_counters: [TotalCounterElement; DIRECTION_BUCKETS],
}

impl TotalSpeedCounters {
    pub fn total(&self, direction: Direction) -> &TotalCounterElement {
        &self.total_counters[direction.bucket()]
    }

    pub fn speed(&self, direction: Direction) -> &TotalCounterElement {
        &self.total_speed_counters[direction.bucket()]
    }

    pub fn average_speed(&self, direction: Direction) -> &TotalCounterElement {
        &self.total_speed_average_counters[direction.bucket()]
    }

    pub fn zeroify(&mut self) {
        for element in self
            .total_counters
            .iter_mut()
            .chain(self.total_speed_counters.iter_mut())
            .chain(self.total_speed_average_counters.iter_mut())
        {
            element.zeroify();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    Packets,
    Bytes,
    Flows,
}

/// Ordering used to rank entities by traffic, highest first.
///
/// Only incoming and outgoing directions have an ordering; anything else
/// compares as equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSortOrder {
    pub field: SortField,
    pub direction: Direction,
}

impl TrafficSortOrder {
    pub fn new(field: SortField, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn compare(&self, a: &TrafficCounters, b: &TrafficCounters) -> Ordering {
        if !matches!(self.direction, Direction::Incoming | Direction::Outgoing) {
            return Ordering::Equal;
        }
        let key = |counters: &TrafficCounters| match self.field {
            SortField::Packets => counters.total.packets(self.direction),
            SortField::Bytes => counters.total.bytes(self.direction),
            SortField::Flows => counters.flows(self.direction),
        };
        key(b).cmp(&key(a))
    }

    /// Sort `(key, counters)` pairs in place, highest traffic first
    pub fn sort<K>(&self, entries: &mut [(K, TrafficCounters)]) {
        entries.sort_by(|a, b| self.compare(&a.1, &b.1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(in_packets: u64, out_bytes: u64, in_flows: u64) -> TrafficCounters {
        TrafficCounters {
            total: TrafficElement {
                in_packets,
                out_bytes,
                ..Default::default()
            },
            in_flows,
            ..Default::default()
        }
    }

    #[test]
    fn test_sort_by_incoming_packets() {
        let mut entries = vec![
            ("a", counters(10, 0, 0)),
            ("b", counters(300, 0, 0)),
            ("c", counters(20, 0, 0)),
        ];
        TrafficSortOrder::new(SortField::Packets, Direction::Incoming).sort(&mut entries);
        let order: Vec<&str> = entries.iter().map(|(k, _)| *k).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_sort_by_outgoing_bytes_and_flows() {
        let a = counters(0, 500, 1);
        let b = counters(0, 100, 9);

        let bytes = TrafficSortOrder::new(SortField::Bytes, Direction::Outgoing);
        assert_eq!(bytes.compare(&a, &b), Ordering::Less);

        let flows = TrafficSortOrder::new(SortField::Flows, Direction::Incoming);
        assert_eq!(flows.compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn test_other_direction_compares_equal() {
        let a = counters(1, 1, 1);
        let b = counters(1000, 1000, 1000);
        for field in [SortField::Packets, SortField::Bytes, SortField::Flows] {
            let order = TrafficSortOrder::new(field, Direction::Other);
            assert_eq!(order.compare(&a, &b), Ordering::Equal);
        }
    }

    #[test]
    fn test_total_speed_counters_zeroify() {
        let mut totals = TotalSpeedCounters::default();
        totals.total_speed_counters[Direction::Outgoing.bucket()].packets = 42;
        totals.total_counters[Direction::Internal.bucket()].bytes = 7;
        assert_eq!(totals.speed(Direction::Outgoing).packets, 42);

        totals.zeroify();
        assert_eq!(totals, TotalSpeedCounters::default());
    }
}
