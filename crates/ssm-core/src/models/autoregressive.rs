//! First-order autoregressive Gaussian emissions.
//!
//! In state `k` the observation follows `y_t ~ N(A_k y_{t−1} + b_k, Q_k)`.
//! The observation before the first step is taken as zero, so `y_0` is
//! centered on `b_k`. Plugged into [`Hmm`](super::Hmm) this gives an
//! autoregressive HMM that fits through the same EM driver.
//!
//! The closed-form update is a weighted Gaussian linear regression of `y_t`
//! on `[y_{t−1}; 1]` per state, with a ridge of `mean_concentration` on the
//! coefficients and the emission prior's pseudo-observations on `Q_k`.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};
use ssm_common::{Error, Result};
use ssm_config::Priors;
use ssm_math::gaussian::{self, LN_2PI};

use super::emissions::{check_obs_dim, check_state, check_weights, covariance_mode, Emissions, MIN_STATE_WEIGHT};
use super::params::{FieldKind, FieldSpec, FlatReader, FlatWriter, ParameterRecord, ParameterSchema};
use super::sample_mvn;
use crate::data::{Dataset, Sequence};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoregressiveEmissions {
    /// `A_k`, each `N × N`.
    weights: Vec<DMatrix<f64>>,
    /// `K × N`, one `b_k` per row.
    biases: DMatrix<f64>,
    covariances: Vec<DMatrix<f64>>,
}

impl AutoregressiveEmissions {
    pub fn new(
        weights: Vec<DMatrix<f64>>,
        biases: DMatrix<f64>,
        covariances: Vec<DMatrix<f64>>,
    ) -> Result<Self> {
        let (k, n) = biases.shape();
        if k == 0 || n == 0 {
            return Err(Error::Config(
                "autoregressive emissions need at least one state and dimension".into(),
            ));
        }
        for (what, len) in [("weight matrices", weights.len()), ("covariances", covariances.len())] {
            if len != k {
                return Err(Error::DimensionMismatch {
                    what: format!("number of autoregressive {what}"),
                    expected: k,
                    got: len,
                });
            }
        }
        for (i, (a, q)) in weights.iter().zip(&covariances).enumerate() {
            if a.shape() != (n, n) {
                return Err(Error::DimensionMismatch {
                    what: format!("autoregressive weights of state {i}"),
                    expected: n,
                    got: a.nrows(),
                });
            }
            if q.shape() != (n, n) {
                return Err(Error::DimensionMismatch {
                    what: format!("emission covariance of state {i}"),
                    expected: n,
                    got: q.nrows(),
                });
            }
            if gaussian::cholesky(q).is_none() {
                return Err(Error::NotPositiveDefinite {
                    what: format!("emission covariance of state {i}"),
                    step: None,
                });
            }
        }
        if biases.iter().chain(weights.iter().flatten()).any(|v| !v.is_finite()) {
            return Err(Error::NonFiniteInput("autoregressive weights or biases".into()));
        }
        Ok(Self {
            weights,
            biases,
            covariances,
        })
    }

    /// `A_k = decay · I`, zero biases and unit covariances.
    pub fn damped(num_states: usize, dim: usize, decay: f64) -> Result<Self> {
        Self::new(
            vec![DMatrix::identity(dim, dim) * decay; num_states],
            DMatrix::zeros(num_states, dim),
            vec![DMatrix::identity(dim, dim); num_states],
        )
    }

    pub fn weights(&self) -> &[DMatrix<f64>] {
        &self.weights
    }

    pub fn biases(&self) -> &DMatrix<f64> {
        &self.biases
    }

    pub fn covariances(&self) -> &[DMatrix<f64>] {
        &self.covariances
    }

    /// `A_k y_prev + b_k`.
    pub fn predicted_mean(&self, state: usize, previous: &DVector<f64>) -> DVector<f64> {
        &self.weights[state] * previous + self.biases.row(state).transpose()
    }
}

/// `[y_{t−1}; 1]` with a zero vector before the first step.
fn regressor(sequence: &Sequence, t: usize) -> DVector<f64> {
    let n = sequence.obs_dim();
    let mut x = DVector::zeros(n + 1);
    if t > 0 {
        x.rows_mut(0, n).copy_from(&sequence.observation(t - 1));
    }
    x[n] = 1.0;
    x
}

impl ParameterRecord for AutoregressiveEmissions {
    fn schema(&self) -> ParameterSchema {
        let (k, n) = self.biases.shape();
        ParameterSchema::new(
            1,
            vec![
                FieldSpec::new("weights", FieldKind::Matrix, vec![k, n, n]),
                FieldSpec::new("biases", FieldKind::Matrix, vec![k, n]),
                FieldSpec::new("covariances", FieldKind::CholeskyFactor, vec![k, n]),
            ],
        )
    }

    fn write_fields(&self, writer: &mut FlatWriter) -> Result<()> {
        for a in &self.weights {
            writer.matrix(a);
        }
        writer.matrix(&self.biases);
        for q in &self.covariances {
            writer.cholesky(q)?;
        }
        Ok(())
    }

    fn read_fields(&self, reader: &mut FlatReader<'_>) -> Result<Self> {
        let (k, n) = self.biases.shape();
        let weights = (0..k).map(|_| reader.matrix(n, n)).collect::<Result<Vec<_>>>()?;
        let biases = reader.matrix(k, n)?;
        let covariances = (0..k).map(|_| reader.cholesky(n)).collect::<Result<Vec<_>>>()?;
        Self::new(weights, biases, covariances)
    }
}

impl Emissions for AutoregressiveEmissions {
    fn num_states(&self) -> usize {
        self.biases.nrows()
    }

    fn obs_dim(&self) -> usize {
        self.biases.ncols()
    }

    fn log_likelihoods(&self, sequence: &Sequence) -> Result<DMatrix<f64>> {
        let n = self.obs_dim();
        check_obs_dim(sequence, n)?;
        let t_len = sequence.num_timesteps();
        let mut out = DMatrix::zeros(t_len, self.num_states());
        for (k, q) in self.covariances.iter().enumerate() {
            let chol = gaussian::cholesky(q).ok_or_else(|| Error::NotPositiveDefinite {
                what: format!("emission covariance of state {k}"),
                step: None,
            })?;
            let norm = -0.5 * (n as f64 * LN_2PI + gaussian::log_det(&chol));
            let mut previous = DVector::zeros(n);
            for t in 0..t_len {
                let y = sequence.observation(t);
                let diff = &y - self.predicted_mean(k, &previous);
                out[(t, k)] = norm - 0.5 * diff.dot(&chol.solve(&diff));
                previous = y;
            }
        }
        Ok(out)
    }

    fn closed_form_update(
        &self,
        dataset: &Dataset,
        weights: &[DMatrix<f64>],
        priors: &Priors,
    ) -> Result<Self> {
        check_weights(dataset, weights, self.num_states())?;
        let n = self.obs_dim();
        let prior = &priors.gaussian;
        let ridge = prior.mean_concentration;
        let mut next = self.clone();

        for k in 0..self.num_states() {
            let mut w_sum = 0.0;
            let mut sxx = DMatrix::<f64>::identity(n + 1, n + 1) * ridge;
            let mut sxy = DMatrix::<f64>::zeros(n + 1, n);
            for (seq, w) in dataset.iter().zip(weights) {
                check_obs_dim(seq, n)?;
                for t in 0..seq.num_timesteps() {
                    let wt = w[(t, k)];
                    let x = regressor(seq, t);
                    w_sum += wt;
                    sxx += wt * gaussian::outer(&x, &x);
                    sxy += wt * &x * seq.observation(t).transpose();
                }
            }
            if w_sum < MIN_STATE_WEIGHT {
                continue;
            }
            let chol = gaussian::cholesky(&sxx).ok_or_else(|| Error::NotPositiveDefinite {
                what: format!("regression statistics of state {k}"),
                step: None,
            })?;
            // (N + 1) × N, rows [Aᵀ; bᵀ]
            let coeffs = chol.solve(&sxy);

            let mut scatter = coeffs.transpose() * &coeffs * ridge;
            for (seq, w) in dataset.iter().zip(weights) {
                for t in 0..seq.num_timesteps() {
                    let resid = seq.observation(t) - coeffs.transpose() * regressor(seq, t);
                    scatter += w[(t, k)] * gaussian::outer(&resid, &resid);
                }
            }
            next.weights[k] = coeffs.rows(0, n).transpose();
            next.biases.set_row(k, &coeffs.row(n));
            next.covariances[k] = covariance_mode(scatter, w_sum, prior);
        }
        Self::new(next.weights, next.biases, next.covariances)
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        state: usize,
        history: &[DVector<f64>],
        rng: &mut R,
    ) -> Result<DVector<f64>> {
        check_state(state, self.num_states())?;
        let previous = history
            .last()
            .cloned()
            .unwrap_or_else(|| DVector::zeros(self.obs_dim()));
        sample_mvn(
            &self.predicted_mean(state, &previous),
            &self.covariances[state],
            rng,
            &format!("emission covariance of state {state}"),
        )
    }
}
