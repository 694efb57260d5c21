use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};
use symtensor_core::{CallOptions, CompileConfig, ElemKind, Function, Graph, Tensor};

fn random_vector(n: usize, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0f32, 1f32).unwrap();
    Tensor::vector((0..n).map(|_| normal.sample(&mut rng)).collect::<Vec<_>>())
}

/// `exp(x) * 0.5 + x`, which fuses into one kernel.
fn exp_chain(config: &CompileConfig) -> Function {
    let mut g = Graph::new();
    let x = g.input(ElemKind::F32, 1);
    let e = g.exp(x).unwrap();
    let half = g.scalar(0.5f32);
    let h = g.mul(e, half).unwrap();
    let y = g.add(h, x).unwrap();
    g.compile(&[x], &[y], &[], config).unwrap()
}

fn bench_exp_chain_host(c: &mut Criterion) {
    const N: usize = 230_400;
    let input = random_vector(N, 0);
    let mut fused = exp_chain(&CompileConfig::host());
    c.bench_function("host_exp_chain_fused", |b| {
        b.iter(|| black_box(fused.call(&[input.clone()]).unwrap()));
    });
    let mut unfused = exp_chain(&CompileConfig::host().exclude_pass("fusion"));
    c.bench_function("host_exp_chain_unfused", |b| {
        b.iter(|| black_box(unfused.call(&[input.clone()]).unwrap()));
    });
}

fn bench_exp_chain_sim(c: &mut Criterion) {
    const N: usize = 230_400;
    let input = random_vector(N, 1);
    let mut f = exp_chain(&CompileConfig::sim(0));
    c.bench_function("sim_exp_chain", |b| {
        b.iter(|| black_box(f.call(&[input.clone()]).unwrap()));
    });
    c.bench_function("sim_exp_chain_borrowed", |b| {
        b.iter(|| {
            let out = f
                .call_with(&[input.clone()], CallOptions::borrowed())
                .unwrap();
            black_box(out);
            f.synchronize().unwrap();
        });
    });
}

fn bench_matmul_host(c: &mut Criterion) {
    const N: usize = 128;
    let mut g = Graph::new();
    let a = g.input(ElemKind::F32, 2);
    let b = g.input(ElemKind::F32, 2);
    let p = g.matmul(a, b).unwrap();
    let mut f = g.compile(&[a, b], &[p], &[], &CompileConfig::host()).unwrap();
    let lhs = random_vector(N * N, 2).reshape([N, N]).unwrap();
    let rhs = random_vector(N * N, 3).reshape([N, N]).unwrap();
    c.bench_function("host_matmul_128x128", |bencher| {
        bencher.iter(|| black_box(f.call(&[lhs.clone(), rhs.clone()]).unwrap()));
    });
}

fn bench_compile(c: &mut Criterion) {
    c.bench_function("compile_exp_chain_sim", |b| {
        b.iter(|| black_box(exp_chain(&CompileConfig::sim(0))));
    });
}

criterion_group!(
    benches,
    bench_exp_chain_host,
    bench_exp_chain_sim,
    bench_matmul_host,
    bench_compile
);
criterion_main!(benches);
