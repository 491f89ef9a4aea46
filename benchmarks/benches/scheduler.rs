//! Benchmarks for graph building and canonical scheduling

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use runtime_core::config::TopologyConfig;
use runtime_core::{CollectiveMode, ResourceClass};
use workflow::{GraphBuilder, GraphLimits, Scheduler, WorkflowGraph};

/// `layers` forward/backward pairs over one activation handle per layer
fn layered_graph(layers: usize) -> WorkflowGraph {
    let mut b = GraphBuilder::named("layers").with_limits(GraphLimits {
        max_nodes: layers * 8 + 16,
        ..GraphLimits::default()
    });
    b.handle("weights", ResourceClass::Buffer, 1 << 20);
    b.handle("grads", ResourceClass::Buffer, 1 << 20);
    b.alloc("alloc_weights", "weights");
    b.alloc("alloc_grads", "grads");

    let names: Vec<String> = (0..layers).map(|i| format!("act{}", i)).collect();
    for name in &names {
        b.handle(name, ResourceClass::Buffer, 1 << 16);
        b.alloc(&format!("alloc_{}", name), name);
    }
    for (i, name) in names.iter().enumerate() {
        let input: Vec<&str> = match i {
            0 => vec!["weights"],
            _ => vec!["weights", names[i - 1].as_str()],
        };
        b.compute(&format!("forward{}", i), &input, &[name]);
    }
    for (i, name) in names.iter().enumerate().rev() {
        b.compute(&format!("backward{}", i), &[name.as_str()], &["grads"]);
    }
    b.collective("allreduce", &["grads"], CollectiveMode::Synchronous);
    b.compute("update", &["grads"], &["weights"]);
    for name in &names {
        b.free(&format!("free_{}", name), name);
    }
    b.build().unwrap()
}

fn schedule_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule");
    let topology = TopologyConfig {
        devices: 4,
        compute_streams: 4,
        copy_streams: 2,
    };

    for layers in [16, 128, 1024] {
        let graph = layered_graph(layers);
        group.throughput(Throughput::Elements(graph.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(layers), &graph, |b, graph| {
            let scheduler = Scheduler::new(topology.clone(), 3);
            b.iter(|| scheduler.schedule(graph).unwrap());
        });
    }
    group.finish();
}

fn build_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    for layers in [16, 128] {
        group.bench_function(BenchmarkId::from_parameter(layers), |b| {
            b.iter(|| layered_graph(layers));
        });
    }
    group.finish();
}

criterion_group!(benches, schedule_benchmark, build_benchmark);
criterion_main!(benches);
