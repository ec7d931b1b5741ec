//! Criterion benchmarks for the exact inference engines.
//!
//! Inputs are synthetic and seeded so runs are comparable across machines.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ssm_core::inference::{gaussian_chain_posterior, hmm_posterior, DiscreteNaturalParams};
use ssm_core::models::{GaussianLds, LdsParams};
use ssm_core::Sequence;

fn random_discrete(k: usize, t: usize, seed: u64) -> DiscreteNaturalParams {
    let mut rng = StdRng::seed_from_u64(seed);
    let init = DVector::from_fn(k, |_, _| rng.random_range(-1.0..1.0));
    let trans = DMatrix::from_fn(k, k, |i, j| if i == j { 2.0 } else { rng.random_range(-1.0..0.0) });
    let ll = DMatrix::from_fn(t, k, |_, _| rng.random_range(-5.0..0.0));
    DiscreteNaturalParams::new(init, trans, ll).expect("valid chain")
}

fn bench_forward_backward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_backward");

    for (k, t) in [(2, 100), (4, 1_000), (8, 1_000), (16, 200)] {
        let params = random_discrete(k, t, 42);
        group.bench_with_input(
            BenchmarkId::new("hmm_posterior", format!("k{k}_t{t}")),
            &params,
            |b, p| {
                b.iter(|| {
                    let post = hmm_posterior(black_box(p)).expect("posterior should compute");
                    black_box(post.expected_states()[(0, 0)]);
                })
            },
        );
    }

    group.finish();
}

fn bench_block_tridiagonal(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_tridiagonal");

    for (d, t) in [(1, 1_000), (4, 500), (10, 200)] {
        let lds = GaussianLds::new(LdsParams::isotropic(d, d)).expect("valid params");
        let mut rng = StdRng::seed_from_u64(7);
        let (_, seq) = lds.sample(t, None, &mut rng).expect("sample");
        let params = lds.natural_params(&seq).expect("natural params");
        group.bench_with_input(
            BenchmarkId::new("gaussian_chain_posterior", format!("d{d}_t{t}")),
            &params,
            |b, p| {
                b.iter(|| {
                    let post = gaussian_chain_posterior(black_box(p)).expect("posterior should compute");
                    black_box(post.log_normalizer());
                })
            },
        );
    }

    // Marginal likelihood adds one trajectory evaluation on top of the solve.
    let lds = GaussianLds::new(LdsParams::isotropic(2, 3)).expect("valid params");
    let mut rng = StdRng::seed_from_u64(9);
    let (_, seq): (_, Sequence) = lds.sample(500, None, &mut rng).expect("sample");
    group.bench_function("lds_infer_posterior_d2_t500", |b| {
        b.iter(|| black_box(lds.infer_posterior(black_box(&seq)).expect("posterior")))
    });

    group.finish();
}

criterion_group!(benches, bench_forward_backward, bench_block_tridiagonal);
criterion_main!(benches);
