//! Step-loop throughput benchmarks
//!
//! Run with: cargo bench --bench step_loop

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use trafix_core::kernel::{MasterKernel, SimulationKernel, TrafficBackend};
use trafix_core::scenario::Scenario;
use trafix_core::sim::{MicroSim, SimConfig};

/// Raw backend stepping at several densities, on a ring so the vehicle
/// count stays fixed over the whole run
fn bench_micro_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro_step");
    for &n in &[8u32, 32, 128] {
        group.throughput(Throughput::Elements(u64::from(n)));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let mut sim = MicroSim::new(SimConfig::micro(), Scenario::ring(1000.0, n));
            sim.start_simulation().unwrap();
            b.iter(|| {
                sim.simulation_step().unwrap();
                black_box(sim.step_count());
            });
        });
    }
    group.finish();
}

/// Cost of materializing a full world frame from the live state
fn bench_world_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_frame");
    for &n in &[32u32, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let mut sim = MicroSim::new(SimConfig::micro(), Scenario::ring(1000.0, n));
            sim.start_simulation().unwrap();
            sim.simulation_step().unwrap();
            b.iter(|| black_box(sim.world()));
        });
    }
    group.finish();
}

/// Full master-kernel step: signal flush, backend tick, frame absorption
fn bench_master_step(c: &mut Criterion) {
    c.bench_function("master_step_32", |b| {
        let sim = MicroSim::new(SimConfig::micro(), Scenario::ring(1000.0, 32));
        let mut master = MasterKernel::new(sim);
        master.start().unwrap();
        b.iter(|| {
            master.step().unwrap();
            black_box(master.vehicle().len());
        });
    });
}

criterion_group!(
    benches,
    bench_micro_step,
    bench_world_extraction,
    bench_master_step
);
criterion_main!(benches);
