//! Reduction driver throughput and eltwise injector generation latency.
//!
//! Run with: cargo bench --bench reduce_benchmark

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use jitkern::{
    best_isa, BalancerInputs, EltwiseAlg, EltwiseConfig, EltwiseKernel, ReduceBalancer, ReductionDriver,
};

fn bench_driver(c: &mut Criterion) {
    let isa = best_isa();
    let mut group = c.benchmark_group("reduction_driver");
    for &(n_src, len) in &[(1usize, 4096usize), (3, 4096), (7, 65536)] {
        let drv = ReductionDriver::<f32>::new(isa, n_src, len, 0, 0, false).unwrap();
        let src = vec![1.0f32; n_src * len];
        let mut dst = vec![0.0f32; len];
        group.throughput(Throughput::Bytes(((n_src + 2) * len * 4) as u64));
        group.bench_with_input(
            BenchmarkId::new(format!("{isa}"), format!("{n_src}x{len}")),
            &len,
            |b, &len| {
                b.iter(|| unsafe { drv.invoke(black_box(dst.as_mut_ptr()), src.as_ptr(), 1, len) });
            },
        );
    }
    group.finish();
}

fn bench_balancer(c: &mut Criterion) {
    c.bench_function("balancer_search_64thr_4096jobs", |b| {
        b.iter(|| ReduceBalancer::new(black_box(BalancerInputs::new(64, 4096, 256, 64))));
    });
}

fn bench_injector_codegen(c: &mut Criterion) {
    let isa = best_isa();
    let mut group = c.benchmark_group("eltwise_codegen");
    for alg in [EltwiseAlg::Relu, EltwiseAlg::Tanh, EltwiseAlg::GeluErf, EltwiseAlg::Log] {
        group.bench_function(format!("{alg:?}_{isa}"), |b| {
            b.iter(|| EltwiseKernel::new(EltwiseConfig::new(black_box(alg))).compile(isa).unwrap());
        });
    }
    group.finish();
}

fn bench_eltwise_run(c: &mut Criterion) {
    let isa = best_isa();
    let xs: Vec<f32> = (0..16384).map(|i| (i as f32 - 8192.0) / 1024.0).collect();
    let mut out = vec![0.0f32; xs.len()];
    let mut group = c.benchmark_group("eltwise_run");
    group.throughput(Throughput::Elements(xs.len() as u64));
    for alg in [EltwiseAlg::Tanh, EltwiseAlg::GeluTanh] {
        let f = EltwiseKernel::new(EltwiseConfig::new(alg)).compile(isa).unwrap();
        group.bench_function(format!("{alg:?}_{isa}"), |b| {
            b.iter(|| f.run(black_box(&xs), &mut out));
        });
    }
    group.finish();
}

criterion_group!(
    name = reduce;
    config = Criterion::default()
        .warm_up_time(std::time::Duration::from_secs(1))
        .measurement_time(std::time::Duration::from_secs(3))
        .sample_size(20);
    targets =
        bench_driver,
        bench_balancer,
        bench_injector_codegen,
        bench_eltwise_run,
);
criterion_main!(reduce);
