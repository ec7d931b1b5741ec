//! End-to-end scenarios: inference on hand-built models and EM on synthetic
//! data drawn from known instances of each family.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use ssm_common::Error;
use ssm_config::{EmissionUpdate, FitConfig, Priors};
use ssm_core::fit::{with_parameters, EmDriver, EmStatus, KMeans, LbfgsOptimizer};
use ssm_core::inference::Posterior;
use ssm_core::models::{
    AutoregressiveEmissions, FactorialHmm, GaussianEmissions, GaussianLds, Hmm, HmmParams,
    LdsParams, NormalFactorialEmissions, PoissonEmissions, StateSpaceModel,
};
use ssm_core::{fit_em, Dataset, Sequence};

fn two_state_gaussian_hmm() -> Hmm<GaussianEmissions> {
    let emissions =
        GaussianEmissions::with_unit_covariance(DMatrix::from_column_slice(2, 1, &[0.0, 5.0]))
            .unwrap();
    let params = HmmParams::new(
        DVector::from_vec(vec![0.5, 0.5]),
        DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.1, 0.9]),
        emissions,
    )
    .unwrap();
    Hmm::new(params).unwrap()
}

fn random_walk_lds() -> GaussianLds {
    let scalar = |v: f64| DMatrix::from_element(1, 1, v);
    GaussianLds::new(LdsParams {
        initial_mean: DVector::zeros(1),
        initial_covariance: scalar(1.0),
        dynamics_matrix: scalar(1.0),
        dynamics_bias: DVector::zeros(1),
        dynamics_covariance: scalar(0.01),
        emissions_matrix: scalar(1.0),
        emissions_bias: DVector::zeros(1),
        emissions_covariance: scalar(1.0),
    })
    .unwrap()
}

/// Share of consecutive bound pairs that do not decrease beyond `slack`.
fn non_decreasing_share(log_probs: &[f64], slack: f64) -> f64 {
    let pairs: Vec<_> = log_probs.windows(2).collect();
    if pairs.is_empty() {
        return 1.0;
    }
    let ok = pairs
        .iter()
        .filter(|w| w[1] >= w[0] - slack * w[0].abs().max(1.0))
        .count();
    ok as f64 / pairs.len() as f64
}

#[test]
fn test_sticky_chain_stays_in_generating_state() {
    let hmm = two_state_gaussian_hmm();
    let seq = Sequence::from_scalars(&[0.1, -0.3, 0.2, 0.05, -0.1]).unwrap();
    let post = hmm.infer_posterior(&seq).unwrap();
    assert!(post.expected_states()[(4, 0)] > 0.9);
    assert_eq!(hmm.most_likely_states(&seq).unwrap(), vec![0; 5]);
}

#[test]
fn test_random_walk_filtered_variance_settles() {
    let lds = random_walk_lds();
    let ys: Vec<f64> = (0..10).map(|t| (t as f64 * 0.7).sin()).collect();

    // The last marginal of a prefix posterior is the filtered distribution.
    let filtered: Vec<f64> = (0..ys.len())
        .map(|t| {
            let seq = Sequence::from_scalars(&ys[..=t]).unwrap();
            lds.infer_posterior(&seq).unwrap().covariances()[t][(0, 0)]
        })
        .collect();

    let q = 0.01_f64;
    let steady = (-q + (q * q + 4.0 * q).sqrt()) / 2.0;
    let mut prior_var = 1.0;
    for (t, v) in filtered.iter().enumerate() {
        assert!(*v < prior_var, "step {t}: {v} not below prior {prior_var}");
        assert!(*v > steady);
        prior_var = v + q;
    }
    for w in filtered.windows(3) {
        assert!(w[1] < w[0]);
        assert!(w[1] - w[2] < w[0] - w[1]);
    }

    let long: Vec<f64> = (0..80).map(|t| (t as f64 * 0.7).sin()).collect();
    let seq = Sequence::from_scalars(&long).unwrap();
    let post = lds.infer_posterior(&seq).unwrap();
    // Smoothed variances in the middle of a long chain are nearly flat.
    let mid = post.covariances()[40][(0, 0)];
    assert!((mid - post.covariances()[41][(0, 0)]).abs() < 1e-4);
    assert!(mid < steady);
}

#[test]
fn test_zero_iterations_returns_initial_params() {
    let mut hmm = two_state_gaussian_hmm();
    let before = hmm.params().clone();
    let data = Dataset::from_sequence(Sequence::from_scalars(&[0.0, 5.0, 5.1]).unwrap());
    let config = FitConfig::default().with_num_iters(0);
    let fit = fit_em(&mut hmm, &data, &config, &Priors::default()).unwrap();
    assert_eq!(fit.params, before);
    assert_eq!(hmm.params(), &before);
    assert!(fit.log_probs.is_empty());
    assert_eq!(fit.iterations, 0);
}

#[test]
fn test_error_inside_injection_scope_restores_params() {
    let mut hmm = two_state_gaussian_hmm();
    let before = hmm.params().clone();
    let mut replacement = before.clone();
    replacement.transition_matrix = DMatrix::from_row_slice(2, 2, &[0.5, 0.5, 0.5, 0.5]);

    let result: ssm_common::Result<()> = with_parameters(&mut hmm, replacement, |m| {
        assert_eq!(m.params().transition_matrix[(0, 1)], 0.5);
        Err(Error::Numerical("failure inside scope".into()))
    });
    assert!(result.is_err());
    assert_eq!(hmm.params(), &before);
}

#[test]
fn test_e_step_is_idempotent() {
    let hmm = two_state_gaussian_hmm();
    let data = Dataset::from_sequence(Sequence::from_scalars(&[0.2, 4.8, 5.3, -0.4]).unwrap());
    assert_eq!(hmm.e_step(&data).unwrap(), hmm.e_step(&data).unwrap());

    let lds = random_walk_lds();
    let a = lds.e_step(&data).unwrap();
    let b = lds.e_step(&data).unwrap();
    assert_eq!(a[0].means(), b[0].means());
    assert_eq!(a[0].marginal_log_likelihood(), b[0].marginal_log_likelihood());
}

#[test]
fn test_gaussian_hmm_em_is_monotone() {
    let truth = two_state_gaussian_hmm();
    let mut rng = StdRng::seed_from_u64(7);
    let sequences = (0..3)
        .map(|_| truth.sample(150, &mut rng).map(|(_, seq)| seq))
        .collect::<ssm_common::Result<Vec<_>>>()
        .unwrap();
    let data = Dataset::new(sequences).unwrap();

    let start = GaussianEmissions::with_unit_covariance(DMatrix::from_column_slice(2, 1, &[1.0, 2.0]))
        .unwrap();
    let mut model = Hmm::from_emissions(start, 0.5).unwrap();
    let priors = Priors::default();
    model.initialize(&data, &KMeans::new(3), &priors).unwrap();

    let config = FitConfig::default().with_num_iters(50).with_tol(1e-8);
    let fit = fit_em(&mut model, &data, &config, &priors).unwrap();
    assert_ne!(fit.status, EmStatus::Failed);
    assert!(fit.log_probs.len() >= 2);
    assert!(non_decreasing_share(&fit.log_probs, 1e-7) >= 0.95);

    let mut means: Vec<f64> = model.emissions().means().iter().copied().collect();
    means.sort_by(|a, b| a.total_cmp(b));
    assert!((means[0] - 0.0).abs() < 0.5);
    assert!((means[1] - 5.0).abs() < 0.5);
}

#[test]
fn test_isolated_outlier_keeps_covariances_positive_definite() {
    let data = Dataset::from_sequence(Sequence::from_scalars(&[0.0, 0.1, -0.1, 0.05, 10.0]).unwrap());
    let start = GaussianEmissions::with_unit_covariance(DMatrix::from_column_slice(2, 1, &[0.0, 1.0]))
        .unwrap();
    let mut model = Hmm::from_emissions(start, 0.5).unwrap();
    let priors = Priors::default();
    model.initialize(&data, &KMeans::new(0), &priors).unwrap();

    let config = FitConfig::default().with_num_iters(25);
    let fit = fit_em(&mut model, &data, &config, &priors).unwrap();
    assert_ne!(fit.status, EmStatus::Failed, "{:?}", fit.error);
    assert!(fit.error.is_none());
    assert!(!fit.log_probs.is_empty());
    assert!(fit.log_probs.iter().all(|lp| lp.is_finite()));
    for cov in model.emissions().covariances() {
        assert!(cov[(0, 0)] > 0.0);
    }
}

#[test]
fn test_factorial_hmm_em_is_monotone() {
    let truth = FactorialHmm::from_emissions(
        &[2, 2],
        NormalFactorialEmissions::new(
            vec![
                DMatrix::from_column_slice(2, 1, &[0.0, 4.0]),
                DMatrix::from_column_slice(2, 1, &[0.0, 1.5]),
            ],
            DVector::from_element(1, 0.1),
        )
        .unwrap(),
        0.9,
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(21);
    let sequences = (0..2)
        .map(|_| truth.sample(120, &mut rng).map(|(_, seq)| seq))
        .collect::<ssm_common::Result<Vec<_>>>()
        .unwrap();
    let data = Dataset::new(sequences).unwrap();

    let start = NormalFactorialEmissions::new(
        vec![
            DMatrix::from_column_slice(2, 1, &[0.5, 2.5]),
            DMatrix::from_column_slice(2, 1, &[-0.5, 0.5]),
        ],
        DVector::from_element(1, 1.0),
    )
    .unwrap();
    let mut model = FactorialHmm::from_emissions(&[2, 2], start, 0.8).unwrap();
    let config = FitConfig::default().with_num_iters(40).with_tol(1e-8);
    let fit = fit_em(&mut model, &data, &config, &Priors::default()).unwrap();

    assert_ne!(fit.status, EmStatus::Failed, "{:?}", fit.error);
    assert!(non_decreasing_share(&fit.log_probs, 1e-7) >= 0.95);
    assert!(fit.log_probs.last().unwrap() > fit.log_probs.first().unwrap());
    assert_eq!(fit.params.chains.len(), 2);
    // Joint means are identifiable even though per-group offsets are not.
    let mut joint: Vec<f64> = (0..4).map(|s| model.emissions().state_mean(s)[0]).collect();
    joint.sort_by(|a, b| a.total_cmp(b));
    for (got, want) in joint.iter().zip([0.0, 1.5, 4.0, 5.5]) {
        assert!((got - want).abs() < 0.5, "joint means {joint:?}");
    }
}

#[test]
fn test_autoregressive_hmm_em_recovers_dynamics() {
    let truth = Hmm::from_emissions(
        AutoregressiveEmissions::new(
            vec![DMatrix::from_element(1, 1, 0.9), DMatrix::from_element(1, 1, -0.6)],
            DMatrix::from_row_slice(2, 1, &[0.0, 1.0]),
            vec![DMatrix::from_element(1, 1, 0.05); 2],
        )
        .unwrap(),
        0.95,
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(17);
    let sequences = (0..3)
        .map(|_| truth.sample(200, &mut rng).map(|(_, seq)| seq))
        .collect::<ssm_common::Result<Vec<_>>>()
        .unwrap();
    let data = Dataset::new(sequences).unwrap();

    let start = AutoregressiveEmissions::new(
        vec![DMatrix::from_element(1, 1, 0.5), DMatrix::from_element(1, 1, -0.2)],
        DMatrix::from_row_slice(2, 1, &[0.0, 0.5]),
        vec![DMatrix::from_element(1, 1, 1.0); 2],
    )
    .unwrap();
    let mut model = Hmm::from_emissions(start, 0.9).unwrap();
    let config = FitConfig::default().with_num_iters(50).with_tol(1e-8);
    let fit = fit_em(&mut model, &data, &config, &Priors::default()).unwrap();

    assert_ne!(fit.status, EmStatus::Failed, "{:?}", fit.error);
    assert!(non_decreasing_share(&fit.log_probs, 1e-7) >= 0.95);
    let mut slopes: Vec<f64> = model.emissions().weights().iter().map(|a| a[(0, 0)]).collect();
    slopes.sort_by(|a, b| a.total_cmp(b));
    assert!((slopes[0] + 0.6).abs() < 0.2, "slopes {slopes:?}");
    assert!((slopes[1] - 0.9).abs() < 0.2, "slopes {slopes:?}");
}

#[test]
fn test_lds_em_is_monotone() {
    let truth = random_walk_lds();
    let mut rng = StdRng::seed_from_u64(11);
    let sequences = (0..2)
        .map(|_| truth.sample(100, None, &mut rng).map(|(_, seq)| seq))
        .collect::<ssm_common::Result<Vec<_>>>()
        .unwrap();
    let data = Dataset::new(sequences).unwrap();

    let mut model = GaussianLds::new(LdsParams::isotropic(1, 1)).unwrap();
    let config = FitConfig::default().with_num_iters(30).with_tol(1e-8);
    let fit = fit_em(&mut model, &data, &config, &Priors::default()).unwrap();
    assert_ne!(fit.status, EmStatus::Failed);
    assert!(non_decreasing_share(&fit.log_probs, 1e-7) >= 0.95);
    assert!(fit.log_probs.last().unwrap() > fit.log_probs.first().unwrap());
    assert_eq!(fit.posteriors.len(), 2);
}

#[test]
fn test_poisson_hmm_gradient_m_step() {
    let truth = Hmm::from_emissions(
        PoissonEmissions::new(DMatrix::from_row_slice(2, 1, &[1.0, 12.0])).unwrap(),
        0.9,
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let (_, seq) = truth.sample(120, &mut rng).unwrap();
    let data = Dataset::from_sequence(seq);

    let mut model = Hmm::from_emissions(
        PoissonEmissions::new(DMatrix::from_row_slice(2, 1, &[2.0, 6.0])).unwrap(),
        0.8,
    )
    .unwrap();
    let config = FitConfig::default()
        .with_num_iters(15)
        .with_emission_update(EmissionUpdate::Gradient);
    let priors = Priors::default();
    let optimizer = LbfgsOptimizer::default();
    let fit = EmDriver::new(&config, &priors)
        .with_optimizer(&optimizer)
        .fit(&mut model, &data)
        .unwrap();

    assert_ne!(fit.status, EmStatus::Failed);
    assert!(fit.log_probs.last().unwrap() > fit.log_probs.first().unwrap());
    let rates = model.emissions().rates();
    assert!(rates[(0, 0)] < 3.0);
    assert!(rates[(1, 0)] > 8.0);
}

#[test]
fn test_gradient_update_without_optimizer_is_an_error() {
    let mut model = two_state_gaussian_hmm();
    let before = model.params().clone();
    let data = Dataset::from_sequence(Sequence::from_scalars(&[0.0, 5.0]).unwrap());
    let config = FitConfig::default().with_emission_update(EmissionUpdate::Gradient);
    let err = fit_em(&mut model, &data, &config, &Priors::default()).unwrap_err();
    assert_eq!(err.code(), 41);
    assert_eq!(model.params(), &before);
}

#[test]
fn test_obs_dim_mismatch_fails_before_inference() {
    let mut model = random_walk_lds();
    let seq = Sequence::new(DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0])).unwrap();
    let data = Dataset::from_sequence(seq);
    let err = fit_em(&mut model, &data, &FitConfig::default(), &Priors::default()).unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { .. }));
}
