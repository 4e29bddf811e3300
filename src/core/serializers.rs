//! Text and JSON rendering shared by the report, Flow Spec and API layers.

use std::fmt::Display;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use crate::core::attack::{protocol_name_by_number, AttackDetails};
use crate::utils::convert_speed_to_mbps;

/// Join the string forms of `items` with `separator`
pub fn join<T: Display>(items: &[T], separator: &str) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(separator)
}

/// Like [`join`], with `prefix` in front of every item
pub fn join_with_prefix<T: Display>(items: &[T], separator: &str, prefix: &str) -> String {
    items
        .iter()
        .map(|item| format!("{}{}", prefix, item))
        .collect::<Vec<_>>()
        .join(separator)
}

const PPS: &str = "packets per second";
const MBPS: &str = "mbps";
const FLOWS: &str = "flows per second";

fn push_line(out: &mut String, label: &str, value: impl Display, unit: &str) {
    out.push_str(&format!("{}: {} {}\n", label, value, unit));
}

/// Human readable attack report, one `Label: value unit` line per metric
pub fn describe_attack(attack: &AttackDetails) -> String {
    let traffic = &attack.traffic;
    let mut out = String::with_capacity(1536);

    out.push_str(&format!("Attack type: {}\n", attack.classify().name()));
    push_line(&mut out, "Initial attack power", attack.attack_power, PPS);
    push_line(&mut out, "Peak attack power", attack.max_attack_power(), PPS);
    out.push_str(&format!("Attack direction: {}\n", attack.attack_direction.name()));
    out.push_str(&format!(
        "Attack protocol: {}\n",
        protocol_name_by_number(attack.attack_protocol)
    ));

    push_line(&mut out, "Total incoming traffic", convert_speed_to_mbps(traffic.total.in_bytes), MBPS);
    push_line(&mut out, "Total outgoing traffic", convert_speed_to_mbps(traffic.total.out_bytes), MBPS);
    push_line(&mut out, "Total incoming pps", traffic.total.in_packets, PPS);
    push_line(&mut out, "Total outgoing pps", traffic.total.out_packets, PPS);
    push_line(&mut out, "Total incoming flows", traffic.in_flows, FLOWS);
    push_line(&mut out, "Total outgoing flows", traffic.out_flows, FLOWS);

    push_line(&mut out, "Average incoming traffic", convert_speed_to_mbps(attack.average_in_bytes), MBPS);
    push_line(&mut out, "Average outgoing traffic", convert_speed_to_mbps(attack.average_out_bytes), MBPS);
    push_line(&mut out, "Average incoming pps", attack.average_in_packets, PPS);
    push_line(&mut out, "Average outgoing pps", attack.average_out_packets, PPS);
    push_line(&mut out, "Average incoming flows", attack.average_in_flows, FLOWS);
    push_line(&mut out, "Average outgoing flows", attack.average_out_flows, FLOWS);

    let breakdowns = [
        ("ip fragmented", &traffic.fragmented),
        ("tcp", &traffic.tcp),
        ("syn tcp", &traffic.tcp_syn),
        ("udp", &traffic.udp),
        ("icmp", &traffic.icmp),
    ];
    for (name, element) in breakdowns {
        push_line(&mut out, &format!("Incoming {} traffic", name), convert_speed_to_mbps(element.in_bytes), MBPS);
        push_line(&mut out, &format!("Outgoing {} traffic", name), convert_speed_to_mbps(element.out_bytes), MBPS);
        push_line(&mut out, &format!("Incoming {} pps", name), element.in_packets, PPS);
        push_line(&mut out, &format!("Outgoing {} pps", name), element.out_packets, PPS);
    }

    out
}

/// JSON form of an attack record for the API and notification hooks
pub fn attack_details_to_json(attack: &AttackDetails) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(attack)?;

    let ban_started_at = Utc
        .timestamp_opt(attack.ban_timestamp() as i64, 0)
        .single()
        .map(|time| time.to_rfc3339());

    if let Value::Object(fields) = &mut value {
        fields.insert("attack_type".to_string(), json!(attack.classify().name()));
        fields.insert("protocol_version".to_string(), json!(attack.protocol_name()));
        fields.insert("ban_started_at".to_string(), json!(ban_started_at));
    }

    Ok(value)
}
