use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use tandem_core::{
    safe_point, AppliedResult, LockManager, LockRequest, Operation, SiteId, TextStore,
    VectorClock,
};
use uuid::Uuid;

fn typed_ops(site: SiteId, n: usize) -> Vec<Operation> {
    let mut store = TextStore::new(site);
    let mut ops = Vec::with_capacity(n);
    for i in 0..n {
        let ch = (b'a' + (i % 26) as u8) as char;
        let applied = store.insert_at(store.len(), &ch.to_string()).unwrap();
        ops.extend(applied.into_iter().map(|a| a.op));
    }
    ops
}

fn bench_local_typing(c: &mut Criterion) {
    let site = SiteId::from_u128(1);
    let mut group = c.benchmark_group("local_typing");
    for n in [100usize, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let mut store = TextStore::new(site);
                for i in 0..n {
                    let at = store.len();
                    let ch = if i % 10 == 9 { " " } else { "x" };
                    black_box(store.insert_at(at, ch).unwrap());
                }
                black_box(store.render());
            })
        });
    }
    group.finish();
}

fn bench_remote_apply(c: &mut Criterion) {
    let ops = typed_ops(SiteId::from_u128(1), 1_000);

    c.bench_function("remote_apply_1k_in_order", |b| {
        b.iter(|| {
            let mut replica = TextStore::new(SiteId::from_u128(2));
            for op in &ops {
                black_box(replica.apply_remote(op.clone()).unwrap());
            }
        })
    });

    c.bench_function("remote_apply_1k_reversed", |b| {
        b.iter(|| {
            let mut replica = TextStore::new(SiteId::from_u128(2));
            let mut last = AppliedResult::Deferred;
            for op in ops.iter().rev() {
                last = replica.apply_remote(op.clone()).unwrap();
            }
            black_box(last);
        })
    });
}

fn bench_render(c: &mut Criterion) {
    let mut store = TextStore::with_content(SiteId::from_u128(1), &"lorem ipsum ".repeat(500));
    store.delete_range(100..2_000).unwrap();

    c.bench_function("render_6k_entries_with_tombstones", |b| {
        b.iter(|| black_box(store.render()))
    });
}

fn bench_compact(c: &mut Criterion) {
    let mut store = TextStore::new(SiteId::from_u128(1));
    store.insert_at(0, &"x".repeat(2_000)).unwrap();
    store.delete_range(1_000..2_000).unwrap();
    let safe = safe_point([store.clock(), store.clock()]);

    c.bench_function("compact_1k_tombstones", |b| {
        b.iter(|| {
            let mut copy = store.clone();
            black_box(copy.compact(&safe));
        })
    });
}

fn bench_clock_compare(c: &mut Criterion) {
    let a: VectorClock = (0..32).map(|i| (SiteId::from_u128(i), i as u64 * 3)).collect();
    let b: VectorClock = (0..32).map(|i| (SiteId::from_u128(i), 100 - i as u64)).collect();

    c.bench_function("clock_compare_32_sites", |bench| {
        bench.iter(|| black_box(black_box(&a).compare(black_box(&b))))
    });
}

fn bench_lock_request(c: &mut Criterion) {
    c.bench_function("lock_request_100_held", |b| {
        b.iter(|| {
            let mut locks = LockManager::new();
            for i in 0..100usize {
                let owner = Uuid::from_u128(i as u128);
                black_box(locks.request(LockRequest::hard(owner, i * 10..i * 10 + 5), 0));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_local_typing,
    bench_remote_apply,
    bench_render,
    bench_compact,
    bench_clock_compare,
    bench_lock_request,
);
criterion_main!(benches);
