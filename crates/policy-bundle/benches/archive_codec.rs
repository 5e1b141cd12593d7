//! Criterion benchmark: archive codec round-trip at a few bundle sizes.
//! Run with: cargo bench -p policy-bundle --bench archive_codec

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use policy_bundle::archive::{read_entries, write_entries, Entry};
use policy_bundle::limits::DecodeLimits;

fn modules(count: usize, body_bytes: usize) -> Vec<Entry> {
    (0..count)
        .map(|i| Entry {
            path: format!("pkg{i}/policy.rego"),
            bytes: vec![b'x'; body_bytes],
        })
        .collect()
}

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("archive_round_trip");
    for &(name, count, body_bytes) in &[("small", 10, 256), ("typical", 200, 1024), ("large", 2_000, 2048)] {
        let entries = modules(count, body_bytes);
        let mut encoded = Vec::new();
        write_entries(&mut encoded, &entries).unwrap();

        group.bench_function(format!("write/{name}"), |b| {
            b.iter(|| {
                let mut buf = Vec::new();
                write_entries(&mut buf, black_box(&entries)).unwrap();
                black_box(buf);
            });
        });

        group.bench_function(format!("read/{name}"), |b| {
            b.iter(|| {
                let decoded = read_entries(black_box(&encoded[..]), &DecodeLimits::default()).unwrap();
                black_box(decoded);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_round_trip);
criterion_main!(benches);
