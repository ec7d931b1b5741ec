//! Hard state assignments used to seed emission parameters.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ssm_common::{Error, Result};
use tracing::debug;

use crate::data::Dataset;
use crate::logging::event_names;

/// Produces one state index per timestep of every sequence.
pub trait StateInitializer: Send + Sync {
    fn assign(&self, dataset: &Dataset, num_states: usize) -> Result<Vec<Vec<usize>>>;
}

fn check_states(num_states: usize) -> Result<()> {
    if num_states == 0 {
        return Err(Error::Config("initializer needs at least one state".into()));
    }
    Ok(())
}

/// Uniform random assignments from a fixed seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomAssignment {
    seed: u64,
}

impl RandomAssignment {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl StateInitializer for RandomAssignment {
    fn assign(&self, dataset: &Dataset, num_states: usize) -> Result<Vec<Vec<usize>>> {
        check_states(num_states)?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let assignments = dataset
            .iter()
            .map(|seq| {
                (0..seq.num_timesteps())
                    .map(|_| rng.random_range(0..num_states))
                    .collect()
            })
            .collect();
        debug!(
            event = event_names::INIT_ASSIGNED,
            method = "random",
            num_states,
            seed = self.seed,
            "assigned states"
        );
        Ok(assignments)
    }
}

/// Lloyd's k-means over every observation row in the dataset.
///
/// Centers start at distinct observations drawn with the seed. A cluster that
/// loses all its points keeps its previous center.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KMeans {
    pub max_iters: usize,
    pub seed: u64,
}

impl Default for KMeans {
    fn default() -> Self {
        Self {
            max_iters: 100,
            seed: 0,
        }
    }
}

impl KMeans {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    /// Centers (`K × N`) and flat labels for the stacked observations.
    pub fn cluster(&self, points: &DMatrix<f64>, k: usize) -> Result<(DMatrix<f64>, Vec<usize>)> {
        check_states(k)?;
        let n = points.nrows();
        if n < k {
            return Err(Error::Config(format!(
                "k-means needs at least {k} observations, got {n}"
            )));
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let seeds = rand::seq::index::sample(&mut rng, n, k).into_vec();
        let mut centers = DMatrix::zeros(k, points.ncols());
        for (j, &row) in seeds.iter().enumerate() {
            centers.set_row(j, &points.row(row));
        }

        let mut labels = vec![usize::MAX; n];
        let mut iterations = 0;
        for _ in 0..self.max_iters.max(1) {
            iterations += 1;
            let mut changed = false;
            for (i, label) in labels.iter_mut().enumerate() {
                let nearest = nearest_center(&centers, &points.row(i).transpose());
                if *label != nearest {
                    *label = nearest;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = DMatrix::<f64>::zeros(k, points.ncols());
            let mut counts = vec![0usize; k];
            for (i, &label) in labels.iter().enumerate() {
                let mut row = sums.row_mut(label);
                row += points.row(i);
                counts[label] += 1;
            }
            for (j, &count) in counts.iter().enumerate() {
                if count > 0 {
                    centers.set_row(j, &(sums.row(j) / count as f64));
                }
            }
        }
        debug!(iterations, num_points = n, k, "k-means finished");
        Ok((centers, labels))
    }
}

fn nearest_center(centers: &DMatrix<f64>, point: &DVector<f64>) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for j in 0..centers.nrows() {
        let dist = (centers.row(j).transpose() - point).norm_squared();
        // Strict comparison keeps ties on the lowest index.
        if dist < best_dist {
            best = j;
            best_dist = dist;
        }
    }
    best
}

impl StateInitializer for KMeans {
    fn assign(&self, dataset: &Dataset, num_states: usize) -> Result<Vec<Vec<usize>>> {
        dataset.check_finite()?;
        let total = dataset.len() * dataset.num_timesteps();
        let dim = dataset.obs_dim();
        let mut points = DMatrix::zeros(total, dim);
        let mut offset = 0;
        for seq in dataset {
            let t = seq.num_timesteps();
            points.view_mut((offset, 0), (t, dim)).copy_from(seq.observations());
            offset += t;
        }

        let (_, labels) = self.cluster(&points, num_states)?;
        let mut rest = labels.as_slice();
        let mut assignments = Vec::with_capacity(dataset.len());
        for seq in dataset {
            let (head, tail) = rest.split_at(seq.num_timesteps());
            assignments.push(head.to_vec());
            rest = tail;
        }
        debug!(
            event = event_names::INIT_ASSIGNED,
            method = "kmeans",
            num_states,
            seed = self.seed,
            "assigned states"
        );
        Ok(assignments)
    }
}
