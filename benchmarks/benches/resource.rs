//! Benchmarks for the resource manager's handle lifecycle

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use effect_log::EffectLog;
use resource::{AllocRequest, ResourceManager, SimulatedBackend, Submission};
use runtime_core::{EffectKind, NodeId, Outcome, ResourceClass, RunManifest, RuntimeContextBuilder};

fn manager() -> ResourceManager {
    let manifest = RunManifest::new("bench", SimulatedBackend::default_release(), vec!["w0".to_string()], 1);
    let ctx = RuntimeContextBuilder::new("w0", manifest).build().unwrap();
    ResourceManager::new(ctx, EffectLog::new("w0"))
}

fn request(i: usize) -> AllocRequest {
    AllocRequest {
        node: Some(NodeId(i as u32)),
        footprint: i as u64,
        label: format!("h{}", i),
        class: ResourceClass::Buffer,
        size_bytes: 4096,
    }
}

fn lifecycle_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("handle_lifecycle");
    group.throughput(Throughput::Elements(1));

    group.bench_function("alloc_write_free", |b| {
        let manager = manager();
        let mut i = 0;
        b.iter(|| {
            let handle = manager.alloc(request(i)).unwrap();
            let token = manager
                .submit(Submission {
                    node: NodeId(i as u32),
                    kind: EffectKind::Compute,
                    footprint: 0,
                    reads: Vec::new(),
                    writes: vec![handle],
                })
                .unwrap();
            manager.complete(&token, Outcome::Succeeded).unwrap();
            manager.free(None, 0, &handle).unwrap();
            i += 1;
        });
    });
    group.finish();
}

fn release_all_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("release_all");
    for live in [16usize, 256, 4096] {
        group.throughput(Throughput::Elements(live as u64));
        group.bench_with_input(BenchmarkId::from_parameter(live), &live, |b, &live| {
            b.iter_batched(
                || {
                    let manager = manager();
                    for i in 0..live {
                        manager.alloc(request(i)).unwrap();
                    }
                    manager
                },
                |manager| manager.release_all().unwrap(),
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, lifecycle_benchmark, release_all_benchmark);
criterion_main!(benches);
