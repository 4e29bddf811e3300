use std::net::{IpAddr, Ipv4Addr};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ddos_mitigation_service::core::conntrack::{ConntrackTable, SessionDirection, SessionProtocol};
use ddos_mitigation_service::core::host_groups::HostGroupTables;

fn build_tables() -> HostGroupTables {
    let mut tables = HostGroupTables::new();
    for i in 0..4096u32 {
        let network = Ipv4Addr::from(0x0a00_0000 | (i << 8));
        tables
            .insert_str(&format!("{}/24", network), "customers")
            .unwrap();
    }
    tables.insert_str("10.0.0.0/8", "global").unwrap();
    tables.insert_str("2001:db8::/32", "global").unwrap();
    tables
}

fn prefix_lookup_benchmark(c: &mut Criterion) {
    let tables = build_tables();
    let hit: IpAddr = "10.0.12.34".parse().unwrap();
    let miss: IpAddr = "198.51.100.1".parse().unwrap();
    let v6: IpAddr = "2001:db8::dead:beef".parse().unwrap();

    c.bench_function("prefix_lookup_ipv4_hit", |b| {
        b.iter(|| tables.lookup_best(black_box(hit)))
    });
    c.bench_function("prefix_lookup_ipv4_miss", |b| {
        b.iter(|| tables.lookup_best(black_box(miss)))
    });
    c.bench_function("prefix_lookup_ipv6_hit", |b| {
        b.iter(|| tables.lookup_best(black_box(v6)))
    });
}

fn conntrack_record_benchmark(c: &mut Criterion) {
    let table = ConntrackTable::new();
    let host: IpAddr = "192.0.2.10".parse().unwrap();
    let mut port = 0u16;

    c.bench_function("conntrack_record", |b| {
        b.iter(|| {
            port = port.wrapping_add(1);
            table.record_at(
                host,
                SessionDirection::Incoming,
                SessionProtocol::Tcp,
                Ipv4Addr::new(198, 51, 100, (port % 250) as u8),
                black_box(port),
                443,
                1500,
                1_700_000_000,
            )
        })
    });
}

criterion_group!(benches, prefix_lookup_benchmark, conntrack_record_benchmark);
criterion_main!(benches);
