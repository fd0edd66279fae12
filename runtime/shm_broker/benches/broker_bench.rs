//! Broker hot paths: allocate + attach, and resolve
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use shm_broker::mock::{MockBoot, MockPlatform};
use std::hint::black_box;
use shm_broker::{BootstrapRegistrar, BrokerConfig, DomainId, RegionBroker};

fn booted() -> RegionBroker<MockPlatform> {
    let platform = MockPlatform::new();
    let boot = MockBoot::new(&platform, 3);
    let broker = RegionBroker::new(platform, BrokerConfig::default()).unwrap();
    BootstrapRegistrar::new(&boot).register_all(&broker).unwrap();
    broker
}

fn allocate_attach_bench(c: &mut Criterion) {
    c.bench_function("allocate+attach", |b| {
        b.iter_batched(
            booted,
            |broker| {
                let handle = broker.allocate(DomainId(2), 1).unwrap();
                broker.attach(DomainId(3), handle).unwrap();
                broker
            },
            BatchSize::SmallInput,
        )
    });
}

fn resolve_bench(c: &mut Criterion) {
    let broker = booted();
    let handles: Vec<_> = (0..64)
        .map(|_| broker.allocate(DomainId(2), 1).unwrap())
        .collect();

    c.bench_function("resolve", |b| {
        b.iter(|| {
            for &handle in &handles {
                black_box(broker.resolve(DomainId(2), handle).unwrap());
            }
        })
    });
}

criterion_group!(benches, allocate_attach_bench, resolve_bench);
criterion_main!(benches);
