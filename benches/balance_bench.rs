//! Criterion micro-benchmarks of load balance policy selection, the pure
//! function sitting on every call's hot path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use replicall::{
    BalancePolicyKind, Endpoint, ReplicantView, ServiceIdentity,
};

fn bench_view(num_endpoints: u16) -> ReplicantView {
    ReplicantView::new(
        ServiceIdentity::new("bench"),
        (0..num_endpoints)
            .map(|i| Endpoint::new(([127, 0, 0, 1], 52700 + i).into()))
            .collect(),
        1,
    )
}

fn policy_select_bench(c: &mut Criterion) {
    let view = bench_view(5);
    for kind in [
        BalancePolicyKind::RoundRobin,
        BalancePolicyKind::FirstAvailable,
        BalancePolicyKind::Random,
        BalancePolicyKind::StickyByKey,
    ] {
        let policy = kind.new_policy();
        c.bench_function(&format!("select_{:?}_5", kind), |b| {
            b.iter(|| {
                policy
                    .select(black_box(&view), black_box(Some("session-77")))
                    .unwrap()
            })
        });
    }
}

fn sticky_many_keys_bench(c: &mut Criterion) {
    let view = bench_view(32);
    let policy = BalancePolicyKind::StickyByKey.new_policy();
    let keys: Vec<String> = (0..1000).map(|i| format!("key-{}", i)).collect();
    let mut next = 0;
    c.bench_function("select_StickyByKey_32_many_keys", |b| {
        b.iter(|| {
            next = (next + 1) % keys.len();
            policy
                .select(black_box(&view), Some(keys[next].as_str()))
                .unwrap()
        })
    });
}

criterion_group!(benches, policy_select_bench, sticky_many_keys_bench);
criterion_main!(benches);
