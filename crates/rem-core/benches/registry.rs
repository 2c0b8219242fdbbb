//! Registry churn at the platform cap and debouncer checks.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rem_core::sim::SimulatedPlatform;
use rem_core::{Coordinate, EvictionPolicy, GeofenceRegistry, NotificationDebouncer, RegionRequest};

const SF: Coordinate = Coordinate::new(37.7749, -122.4194);

fn bench_register_at_capacity(c: &mut Criterion) {
    let mut group = c.benchmark_group("register_at_capacity");
    for policy in [EvictionPolicy::OldestCreated, EvictionPolicy::LeastRecentlyVisited] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{policy:?}")),
            &policy,
            |b, &policy| {
                let mut platform = SimulatedPlatform::new();
                let mut registry = GeofenceRegistry::new(20, policy);
                let mut now = 0u64;
                b.iter(|| {
                    now += 1;
                    let request = RegionRequest::new(format!("r{now}"), SF, 100.0);
                    let _ = registry.register(request, None, now, &mut platform);
                    black_box(registry.take_removed());
                    platform.clear_calls();
                });
            },
        );
    }
    group.finish();
}

fn bench_debouncer(c: &mut Criterion) {
    let debouncer = NotificationDebouncer::new(300_000);
    let ids: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
    let mut now = 0u64;
    c.bench_function("debouncer_should_fire", |b| {
        b.iter(|| {
            now += 1_000;
            for id in &ids {
                black_box(debouncer.should_fire(id, now));
            }
        });
    });
}

fn bench_distance(c: &mut Criterion) {
    let other = SF.offset_meters(120.0, -45.0);
    c.bench_function("haversine", |b| {
        b.iter(|| black_box(black_box(SF).distance_meters(black_box(&other))));
    });
}

criterion_group!(benches, bench_register_at_capacity, bench_debouncer, bench_distance);
criterion_main!(benches);
