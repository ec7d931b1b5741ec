//! Criterion benchmarks for whole EM runs on synthetic data.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;
use ssm_config::{FitConfig, Priors};
use ssm_core::models::{GaussianEmissions, GaussianLds, Hmm, LdsParams, PoissonEmissions};
use ssm_core::{fit_em, Dataset};

fn gaussian_hmm_data() -> Dataset {
    let emissions = GaussianEmissions::with_unit_covariance(DMatrix::from_column_slice(
        3,
        1,
        &[-4.0, 0.0, 4.0],
    ))
    .expect("valid emissions");
    let truth = Hmm::from_emissions(emissions, 0.95).expect("valid hmm");
    let mut rng = StdRng::seed_from_u64(1);
    let sequences = (0..4)
        .map(|_| truth.sample(250, &mut rng).map(|(_, s)| s).expect("sample"))
        .collect();
    Dataset::new(sequences).expect("dataset")
}

fn bench_em(c: &mut Criterion) {
    let mut group = c.benchmark_group("em_fit");
    group.sample_size(20);

    // Fixed iteration count; tol 0 keeps every run the same length.
    let config = FitConfig::default().with_num_iters(10).with_tol(0.0);
    let priors = Priors::default();

    let data = gaussian_hmm_data();
    group.bench_function("gaussian_hmm_k3", |b| {
        b.iter(|| {
            let emissions = GaussianEmissions::with_unit_covariance(DMatrix::from_column_slice(
                3,
                1,
                &[-1.0, 0.5, 1.0],
            ))
            .expect("valid emissions");
            let mut model = Hmm::from_emissions(emissions, 0.8).expect("valid hmm");
            let fit = fit_em(&mut model, black_box(&data), &config, &priors).expect("fit");
            black_box(fit.log_probs.len());
        })
    });

    let poisson_truth = Hmm::from_emissions(
        PoissonEmissions::new(DMatrix::from_row_slice(2, 2, &[1.0, 3.0, 8.0, 2.0]))
            .expect("valid emissions"),
        0.9,
    )
    .expect("valid hmm");
    let mut rng = StdRng::seed_from_u64(2);
    let (_, seq) = poisson_truth.sample(1_000, &mut rng).expect("sample");
    let counts = Dataset::from_sequence(seq);
    group.bench_function("poisson_hmm_k2", |b| {
        b.iter(|| {
            let emissions = PoissonEmissions::new(DMatrix::from_element(2, 2, 2.0) + DMatrix::identity(2, 2))
                .expect("valid emissions");
            let mut model = Hmm::from_emissions(emissions, 0.8).expect("valid hmm");
            let fit = fit_em(&mut model, black_box(&counts), &config, &priors).expect("fit");
            black_box(fit.log_probs.len());
        })
    });

    let lds_truth = GaussianLds::new(LdsParams::isotropic(2, 2)).expect("valid params");
    let mut rng = StdRng::seed_from_u64(3);
    let (_, seq) = lds_truth.sample(300, None, &mut rng).expect("sample");
    let lds_data = Dataset::from_sequence(seq);
    group.bench_function("gaussian_lds_d2", |b| {
        b.iter(|| {
            let mut model = GaussianLds::new(LdsParams::isotropic(2, 2)).expect("valid params");
            let fit = fit_em(&mut model, black_box(&lds_data), &config, &priors).expect("fit");
            black_box(fit.log_probs.len());
        })
    });

    group.finish();
}

criterion_group!(benches, bench_em);
criterion_main!(benches);
