//! Flow-key and session-table benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use spinpath::{FlowKey, ProtocolVariant, SessionTable};

fn bench_flow_key_hash(c: &mut Criterion) {
    c.bench_function("flow_key_hash", |b| {
        b.iter(|| {
            FlowKey::new(
                black_box(0xC0A80101),
                black_box(0x08080808),
                black_box(12345),
                black_box(443),
                black_box(6),
            )
        })
    });

    c.bench_function("flow_key_hash_with_cat", |b| {
        b.iter(|| {
            FlowKey::with_cat(
                black_box(0xC0A80101),
                black_box(0x08080808),
                black_box(12345),
                black_box(443),
                black_box(17),
                black_box(0xDEADBEEF_CAFEBABE),
            )
        })
    });
}

fn bench_session_lookup(c: &mut Criterion) {
    const FLOWS: u32 = 100_000;

    let mut table = SessionTable::new(FLOWS as usize);
    for i in 0..FLOWS {
        let key = FlowKey::new(i, 0x08080808, 12345, 443, 6);
        table.create(key, ProtocolVariant::Tcp).unwrap();
    }

    let hit = FlowKey::new(FLOWS / 2, 0x08080808, 12345, 443, 6);
    let miss = FlowKey::new(FLOWS + 7, 0x08080808, 12345, 443, 6);

    c.bench_function("session_lookup_hit_100k", |b| {
        b.iter(|| table.lookup(black_box(hit)))
    });
    c.bench_function("session_lookup_miss_100k", |b| {
        b.iter(|| table.lookup(black_box(miss)))
    });
}

fn bench_session_churn(c: &mut Criterion) {
    c.bench_function("session_create_remove", |b| {
        let mut table = SessionTable::new(1024);
        let fwd = FlowKey::new(1, 2, 3, 4, 6);
        let rev = FlowKey::new(0, 9, 3, 4, 6);
        b.iter(|| {
            let h = table.create(black_box(fwd), ProtocolVariant::Tcp).unwrap();
            table.alias(rev, h).unwrap();
            table.remove(h)
        })
    });
}

criterion_group!(
    benches,
    bench_flow_key_hash,
    bench_session_lookup,
    bench_session_churn,
);
criterion_main!(benches);
