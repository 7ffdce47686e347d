use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mangrove::{EngineConfig, Keyspace, LookupFlags, ScanOptions, Value};

fn populated(count: usize) -> Keyspace {
    let mut ks = Keyspace::new(EngineConfig::default());
    for i in 0..count {
        ks.add(
            0,
            format!("key:{i}").as_bytes(),
            Value::string(Bytes::from(format!("value-{i}"))),
        );
    }
    ks
}

fn bench_set_key(c: &mut Criterion) {
    c.bench_function("set_key/overwrite", |b| {
        let mut ks = populated(10_000);
        let mut i = 0usize;
        b.iter(|| {
            let key = format!("key:{}", i % 10_000);
            ks.set_key(0, key.as_bytes(), Value::string(Bytes::from_static(b"x")));
            i += 1;
        });
    });
}

fn bench_lookup(c: &mut Criterion) {
    c.bench_function("lookup_read/hit", |b| {
        let mut ks = populated(10_000);
        let mut i = 0usize;
        b.iter(|| {
            let key = format!("key:{}", i % 10_000);
            black_box(ks.lookup_read(0, key.as_bytes(), LookupFlags::NONE));
            i += 1;
        });
    });

    c.bench_function("lookup_read/miss", |b| {
        let mut ks = populated(10_000);
        b.iter(|| {
            black_box(ks.lookup_read(0, b"absent", LookupFlags::NONE));
        });
    });
}

fn bench_scan(c: &mut Criterion) {
    c.bench_function("scan_keys/full", |b| {
        let mut ks = populated(10_000);
        let opts = ScanOptions {
            count: Some(100),
            ..ScanOptions::default()
        };
        b.iter(|| {
            let mut cursor = 0;
            let mut total = 0;
            loop {
                let (next, keys) = ks.scan_keys(0, cursor, &opts).unwrap();
                total += keys.len();
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            black_box(total);
        });
    });
}

fn bench_snapshot(c: &mut Criterion) {
    c.bench_function("snapshot/create_release", |b| {
        let mut ks = populated(10_000);
        b.iter(|| {
            let snap = ks.create_snapshot(0);
            black_box(snap.size());
            ks.release_snapshot(snap);
        });
    });
}

criterion_group!(
    benches,
    bench_set_key,
    bench_lookup,
    bench_scan,
    bench_snapshot
);
criterion_main!(benches);
