use crate::reference_density::{bimodal_sample, reference_kernel_sums};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sgpu_kde::prelude::*;

#[path = "../tests/reference_density.rs"]
mod reference_density;

fn kde_benchmark(c: &mut Criterion) {
    const N: usize = 4096;
    const H: f32 = 0.3;
    let x = bimodal_sample(N, 42);

    match GpuKde::new() {
        Ok(mut gpu) => {
            c.bench_function("gaussian kde GPU", |b| {
                b.iter(|| gpu.estimate(black_box(&x), H).unwrap())
            });
        }
        Err(err) => println!("skipping GPU benchmark: {}", err),
    }

    let cpu = Estimator::new(KdeConfig::cpu()).unwrap();
    c.bench_function("gaussian kde CPU worker groups", |b| {
        b.iter(|| cpu.estimate(N, H, black_box(&x)).unwrap())
    });
    c.bench_function("gaussian kde f64 reference", |b| {
        b.iter(|| reference_kernel_sums(black_box(&x), H))
    });
}

fn criterion_benchmark(c: &mut Criterion) {
    kde_benchmark(c);
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
