use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use umbral::core::ratelimit::RateLimiter;
use umbral::modes::redis::redirect::RedirectParser;
use umbral::modes::redis::resp::{RespEncoder, RespParser};
use umbral::modes::redis::slots::{key_slot, parse_cluster_nodes};
use umbral::modes::redis::take_command;
use umbral::modes::redis::topology::Topology;

/// Three masters with one replica each
fn cluster_table() -> String {
    let masters = [(0u16, 5460u16), (5461, 10922), (10923, 16383)];
    let mut table = String::new();
    for (i, (start, end)) in masters.iter().enumerate() {
        table.push_str(&format!(
            "master{i} 10.0.0.{i}:7000@17000 master - 0 0 {i} connected {start}-{end}\n"
        ));
        table.push_str(&format!(
            "replica{i} 10.0.1.{i}:7000@17000 slave master{i} 0 0 {i} connected\n"
        ));
    }
    table
}

fn bench_key_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_slot");
    for key in ["foo", "user:{1000}:profile", "a-much-longer-session-key-without-any-tag"] {
        group.throughput(Throughput::Bytes(key.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(key), key.as_bytes(), |b, key| {
            b.iter(|| black_box(key_slot(key)))
        });
    }
    group.finish();
}

fn bench_topology(c: &mut Criterion) {
    let table = cluster_table();

    c.bench_function("parse_cluster_nodes", |b| {
        b.iter(|| black_box(parse_cluster_nodes(&table)))
    });

    c.bench_function("topology_from_cluster_nodes", |b| {
        b.iter(|| black_box(Topology::from_cluster_nodes(&table)))
    });

    if let Ok(topology) = Topology::from_cluster_nodes(&table) {
        c.bench_function("select_for_read", |b| {
            b.iter(|| black_box(topology.select_for_command(Some(&b"user:42"[..]), true).is_ok()))
        });
    }
}

fn bench_resp(c: &mut Criterion) {
    let command = RespEncoder::command(["SET", "user:{1000}:profile", "some-payload-value"]);
    let pipeline: Vec<u8> = command.iter().copied().cycle().take(command.len() * 64).collect();

    c.bench_function("resp_parse_command", |b| {
        b.iter(|| black_box(RespParser::parse(&command)))
    });

    c.bench_function("take_command_pipeline", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&pipeline[..]);
            let mut count = 0;
            while let Ok(Some(cmd)) = take_command(&mut buf) {
                black_box(cmd);
                count += 1;
            }
            count
        })
    });

    c.bench_function("parse_moved_redirect", |b| {
        b.iter(|| black_box(RedirectParser::parse_redirect_raw(b"-MOVED 3999 10.0.0.2:7000\r\n")))
    });
}

fn bench_rate_limiter(c: &mut Criterion) {
    let limiter = RateLimiter::per_second(1_000_000.0);
    c.bench_function("rate_limiter_allow", |b| b.iter(|| black_box(limiter.allow())));
}

criterion_group!(benches, bench_key_slot, bench_topology, bench_resp, bench_rate_limiter);
criterion_main!(benches);
