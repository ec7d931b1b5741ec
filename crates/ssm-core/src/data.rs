//! Observation sequences and batches.
//!
//! A [`Sequence`] is a `T × N` observation matrix (one row per time step) with
//! an optional `T × U` covariate matrix. A [`Dataset`] is a batch of
//! independent sequences that all share the same length and observation
//! dimension.

use nalgebra::{DMatrix, DVector};
use ssm_common::{Error, Result};

/// One observed time series.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    observations: DMatrix<f64>,
    covariates: Option<DMatrix<f64>>,
}

impl Sequence {
    /// Build a sequence from a `T × N` matrix. `T` must be at least 1.
    pub fn new(observations: DMatrix<f64>) -> Result<Self> {
        if observations.nrows() == 0 {
            return Err(Error::Config("sequence has no time steps".to_string()));
        }
        if observations.ncols() == 0 {
            return Err(Error::Config("observations have zero dimension".to_string()));
        }
        Ok(Self {
            observations,
            covariates: None,
        })
    }

    /// Attach per-step covariates (`T × U`).
    pub fn with_covariates(mut self, covariates: DMatrix<f64>) -> Result<Self> {
        if covariates.nrows() != self.num_timesteps() {
            return Err(Error::DimensionMismatch {
                what: "covariate rows".to_string(),
                expected: self.num_timesteps(),
                got: covariates.nrows(),
            });
        }
        self.covariates = Some(covariates);
        Ok(self)
    }

    /// Build a one-dimensional sequence from scalar observations.
    pub fn from_scalars(values: &[f64]) -> Result<Self> {
        Self::new(DMatrix::from_column_slice(values.len(), 1, values))
    }

    /// Build a sequence from per-step observation vectors.
    pub fn from_rows(rows: &[DVector<f64>]) -> Result<Self> {
        let Some(first) = rows.first() else {
            return Err(Error::Config("sequence has no time steps".to_string()));
        };
        let n = first.len();
        for (t, row) in rows.iter().enumerate() {
            if row.len() != n {
                return Err(Error::DimensionMismatch {
                    what: format!("observation at step {t}"),
                    expected: n,
                    got: row.len(),
                });
            }
        }
        Self::new(DMatrix::from_fn(rows.len(), n, |t, i| rows[t][i]))
    }

    pub fn num_timesteps(&self) -> usize {
        self.observations.nrows()
    }

    pub fn obs_dim(&self) -> usize {
        self.observations.ncols()
    }

    pub fn observations(&self) -> &DMatrix<f64> {
        &self.observations
    }

    pub fn covariates(&self) -> Option<&DMatrix<f64>> {
        self.covariates.as_ref()
    }

    /// Observation at step `t` as a column vector.
    pub fn observation(&self, t: usize) -> DVector<f64> {
        self.observations.row(t).transpose()
    }

    /// Covariate at step `t`, if covariates are attached.
    pub fn covariate(&self, t: usize) -> Option<DVector<f64>> {
        self.covariates.as_ref().map(|c| c.row(t).transpose())
    }

    pub(crate) fn check_finite(&self) -> Result<()> {
        if self.observations.iter().any(|v| !v.is_finite()) {
            return Err(Error::NonFiniteInput("observations".to_string()));
        }
        Ok(())
    }
}

/// A batch of independent sequences of equal shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    sequences: Vec<Sequence>,
}

impl Dataset {
    /// Build a batch. Ragged sequences are rejected.
    pub fn new(sequences: Vec<Sequence>) -> Result<Self> {
        let Some(first) = sequences.first() else {
            return Err(Error::Config("dataset has no sequences".to_string()));
        };
        let (t, n) = (first.num_timesteps(), first.obs_dim());
        let covariate_dim = first.covariates().map(|c| c.ncols());
        for (i, seq) in sequences.iter().enumerate().skip(1) {
            if seq.num_timesteps() != t {
                return Err(Error::DimensionMismatch {
                    what: format!("length of sequence {i}"),
                    expected: t,
                    got: seq.num_timesteps(),
                });
            }
            if seq.obs_dim() != n {
                return Err(Error::DimensionMismatch {
                    what: format!("observation dimension of sequence {i}"),
                    expected: n,
                    got: seq.obs_dim(),
                });
            }
            if seq.covariates().map(|c| c.ncols()) != covariate_dim {
                return Err(Error::Config(format!(
                    "sequence {i} covariates do not match sequence 0"
                )));
            }
        }
        Ok(Self { sequences })
    }

    pub fn from_sequence(sequence: Sequence) -> Self {
        Self {
            sequences: vec![sequence],
        }
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sequence> {
        self.sequences.iter()
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn num_timesteps(&self) -> usize {
        self.sequences[0].num_timesteps()
    }

    pub fn obs_dim(&self) -> usize {
        self.sequences[0].obs_dim()
    }

    /// Checks every observation is finite, reporting the offending sequence.
    pub fn check_finite(&self) -> Result<()> {
        for (i, seq) in self.sequences.iter().enumerate() {
            seq.check_finite().map_err(|e| e.in_sequence(i))?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a Sequence;
    type IntoIter = std::slice::Iter<'a, Sequence>;

    fn into_iter(self) -> Self::IntoIter {
        self.sequences.iter()
    }
}
