use ndarray::prelude::*;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;

use super::{Background, FitOptions, InitStrategy, MixtureModel};
use crate::features::FeatureMatrix;
use crate::{GmmError, Result, VSMALL};

/// Draws initial and replacement components from the valid rows of a feature matrix.
///
/// All randomness comes from one ChaCha12 stream seeded by the fit seed, so a fit and all of its
/// re-seeds are reproducible.
pub(crate) struct Seeder {
    valid_rows: Vec<usize>,
    feature_mean: Array1<f64>,
    feature_min: Array1<f64>,
    feature_max: Array1<f64>,
    base_covariance: Array2<f64>,
    rng: ChaCha12Rng,
}

impl Seeder {
    pub(crate) fn new(matrix: &FeatureMatrix, seed: u64, reg_covar: f64) -> Self {
        let m = matrix.n_features();
        let values = matrix.values();
        let mask = matrix.mask();

        let mut feature_mean = Array1::<f64>::zeros(m);
        let mut feature_var = Array1::<f64>::ones(m);
        let mut feature_min = Array1::<f64>::zeros(m);
        let mut feature_max = Array1::<f64>::ones(m);
        for d in 0..m {
            let column: Vec<f64> = values
                .column(d)
                .iter()
                .zip(mask.column(d))
                .filter(|&(_, &valid)| valid)
                .map(|(&v, _)| v)
                .collect();
            if column.is_empty() {
                continue;
            }
            let n = column.len() as f64;
            let mean = column.iter().sum::<f64>() / n;
            let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            feature_mean[d] = mean;
            if var > VSMALL {
                feature_var[d] = var;
            }
            feature_min[d] = column.iter().copied().fold(f64::INFINITY, f64::min);
            feature_max[d] = column.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        }

        let base_covariance = Array2::from_diag(&(feature_var + reg_covar));
        Seeder {
            valid_rows: (0..matrix.n_rows()).filter(|&i| !matrix.row_is_empty(i)).collect(),
            feature_mean,
            feature_min,
            feature_max,
            base_covariance,
            rng: ChaCha12Rng::seed_from_u64(seed),
        }
    }

    /// Builds the starting mixture with equal weights and the diagonal data covariance.
    pub(crate) fn initial_model(&mut self, matrix: &FeatureMatrix, options: &FitOptions) -> Result<MixtureModel> {
        let k = options.num_components;
        let m = matrix.n_features();
        let means = match &options.init {
            InitStrategy::RandomRows => {
                let picks = index::sample(&mut self.rng, self.valid_rows.len(), k);
                self.means_from_rows(matrix, picks.into_iter().map(|p| self.valid_rows[p]))
            }
            InitStrategy::SpatialGrid => {
                let rows = self.grid_rows(matrix, k);
                self.means_from_rows(matrix, rows.into_iter())
            }
            InitStrategy::Means(means) => {
                if means.dim() != (k, m) {
                    return Err(GmmError::shape(
                        "fit_model",
                        format!("initial means are {:?}, expected ({k}, {m})", means.dim()),
                    ));
                }
                means.clone()
            }
        };

        let mut covariances = Array3::<f64>::zeros((k, m, m));
        for mut cov in covariances.outer_iter_mut() {
            cov.assign(&self.base_covariance);
        }
        Ok(MixtureModel {
            weights: Array1::from_elem(k, 1.0 / k as f64),
            means,
            covariances,
            background: None,
        })
    }

    /// Uniform background over the bounding box of the valid data.
    pub(crate) fn background(&self, amplitude: f64) -> Background {
        let log_density = (&self.feature_max - &self.feature_min).mapv(|range| {
            if range > VSMALL {
                -range.ln()
            } else {
                0.0
            }
        });
        Background {
            amplitude,
            log_density,
        }
    }

    /// Replaces component `c` with a fresh random valid row and the initial covariance.
    pub(crate) fn reseed(&mut self, model: &mut MixtureModel, matrix: &FeatureMatrix, c: usize) {
        let pick = self.valid_rows[self.rng.random_range(0..self.valid_rows.len())];
        let mean = self.row_mean(matrix, pick);
        model.means.row_mut(c).assign(&mean);
        model
            .covariances
            .index_axis_mut(Axis(0), c)
            .assign(&self.base_covariance);
        model.weights[c] = 1.0 / model.n_components() as f64;
        model.renormalize_weights();
    }

    fn means_from_rows(&self, matrix: &FeatureMatrix, rows: impl Iterator<Item = usize>) -> Array2<f64> {
        let means: Vec<Array1<f64>> = rows.map(|i| self.row_mean(matrix, i)).collect();
        let views: Vec<ArrayView1<'_, f64>> = means.iter().map(|row| row.view()).collect();
        // every row has n_features entries
        ndarray::stack(Axis(0), &views).unwrap_or_else(|_| Array2::zeros((0, matrix.n_features())))
    }

    /// Row values with masked features replaced by the feature mean.
    fn row_mean(&self, matrix: &FeatureMatrix, i: usize) -> Array1<f64> {
        let values = matrix.values();
        let mask = matrix.mask();
        Array1::from_shape_fn(matrix.n_features(), |d| {
            if mask[[i, d]] {
                values[[i, d]]
            } else {
                self.feature_mean[d]
            }
        })
    }

    /// First `k` centres of a near-square grid over the spatial extent, each moved to the
    /// spatially nearest unused valid row. Ties go to the lower flat index.
    fn grid_rows(&self, matrix: &FeatureMatrix, k: usize) -> Vec<usize> {
        let shape = matrix.shape();
        let grid_rows = (k as f64).sqrt().ceil() as usize;
        let grid_cols = k.div_ceil(grid_rows);
        let mut picked: Vec<usize> = Vec::with_capacity(k);
        for j in 0..k {
            let (a, b) = (j / grid_cols, j % grid_cols);
            let r = ((2 * a + 1) * shape.rows) / (2 * grid_rows);
            let c = ((2 * b + 1) * shape.cols) / (2 * grid_cols);
            let nearest = self
                .valid_rows
                .iter()
                .copied()
                .filter(|i| !picked.contains(i))
                .min_by_key(|&i| {
                    let (ri, ci) = shape.coords(i);
                    (ri.abs_diff(r).pow(2) + ci.abs_diff(c).pow(2), i)
                });
            if let Some(i) = nearest {
                picked.push(i);
            }
        }
        picked
    }
}
