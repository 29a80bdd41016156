use ndarray::prelude::*;
use rayon::prelude::*;

use super::linalg::{cholesky, log_det, log_gaussian, sub_cholesky};
use super::MixtureModel;
use crate::features::FeatureMatrix;
use crate::{GmmError, Result};

/// Posterior component memberships of every row of a feature matrix.
///
/// Rows without a single valid feature are flagged in `valid`. Their responsibilities are zero
/// and their log-likelihoods are negative infinity.
#[derive(Clone, Debug)]
pub struct Responsibilities {
    /// N x K posterior probabilities. Each valid row sums to one minus its background share.
    pub component: Array2<f64>,
    pub background: Option<Array1<f64>>,
    /// N x K weighted log-densities `ln((1 - a) w_k) + ln N_k(x_i)`.
    pub log_terms: Array2<f64>,
    /// Log-density of the whole mixture at each row.
    pub log_likelihood: Array1<f64>,
    pub valid: Array1<bool>,
}

impl Responsibilities {
    pub fn n_valid(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Sum of the mixture log-likelihood over the valid rows.
    pub fn total_log_likelihood(&self) -> f64 {
        self.log_likelihood
            .iter()
            .zip(&self.valid)
            .filter(|&(_, &v)| v)
            .map(|(&ll, _)| ll)
            .sum()
    }

    pub fn mean_log_likelihood(&self) -> f64 {
        self.total_log_likelihood() / self.n_valid().max(1) as f64
    }
}

/// Computes the posterior responsibilities of `model` for every row of `matrix`.
///
/// Only the observed features of a row enter its densities, through the marginal
/// `N(x_o | mu_o, Sigma_oo)`. Rows are evaluated in parallel.
///
/// # Errors
///
/// * `GmmError::Shape` if the matrix and the model have different feature counts.
/// * `GmmError::DegenerateFit` if a component covariance cannot be factorized.
pub fn responsibilities(model: &MixtureModel, matrix: &FeatureMatrix) -> Result<Responsibilities> {
    if model.n_features() != matrix.n_features() {
        return Err(GmmError::shape(
            "responsibilities",
            format!(
                "model has {} features but the matrix has {}",
                model.n_features(),
                matrix.n_features()
            ),
        ));
    }
    Ok(PreparedModel::new(model, 0)?.responsibilities(model, matrix))
}

/// Per-component quantities that stay fixed during one expectation step.
pub(crate) struct PreparedModel {
    chol: Vec<Array2<f64>>,
    log_det: Vec<f64>,
    log_weights: Vec<f64>,
    log_background_weight: Option<f64>,
}

/// Everything an expectation step learns about one row.
struct RowPosterior {
    log_terms: Vec<f64>,
    resp: Vec<f64>,
    background: f64,
    log_likelihood: f64,
    valid: bool,
}

impl PreparedModel {
    /// Factorizes every component covariance of `model`.
    ///
    /// # Errors
    ///
    /// * `GmmError::DegenerateFit` naming the first component whose covariance is singular.
    pub(crate) fn new(model: &MixtureModel, iteration: usize) -> Result<Self> {
        let k = model.n_components();
        let amplitude = model.background.as_ref().map_or(0.0, |bg| bg.amplitude);
        let mut chol = Vec::with_capacity(k);
        let mut log_dets = Vec::with_capacity(k);
        for (component, cov) in model.covariances.outer_iter().enumerate() {
            let l = cholesky(cov).map_err(|err| GmmError::DegenerateFit {
                component,
                iteration,
                reason: err.to_string(),
            })?;
            log_dets.push(log_det(l.view()));
            chol.push(l);
        }
        let log_weights = model
            .weights
            .iter()
            .map(|&w| ((1.0 - amplitude) * w).ln())
            .collect();
        Ok(PreparedModel {
            chol,
            log_det: log_dets,
            log_weights,
            log_background_weight: model.background.as_ref().map(|bg| bg.amplitude.ln()),
        })
    }

    pub(crate) fn responsibilities(&self, model: &MixtureModel, matrix: &FeatureMatrix) -> Responsibilities {
        let n = matrix.n_rows();
        let k = model.n_components();
        let values = matrix.values();
        let mask = matrix.mask();

        let rows: Vec<RowPosterior> = (0..n)
            .into_par_iter()
            .map(|i| self.evaluate_row(model, values.row(i), mask.row(i)))
            .collect();

        let mut component = Array2::<f64>::zeros((n, k));
        let mut log_terms = Array2::<f64>::from_elem((n, k), f64::NEG_INFINITY);
        let mut log_likelihood = Array1::<f64>::from_elem(n, f64::NEG_INFINITY);
        let mut background = model.background.as_ref().map(|_| Array1::<f64>::zeros(n));
        let mut valid = Array1::from_elem(n, false);
        for (i, row) in rows.into_iter().enumerate() {
            component.row_mut(i).assign(&ArrayView1::from(&row.resp));
            log_terms.row_mut(i).assign(&ArrayView1::from(&row.log_terms));
            log_likelihood[i] = row.log_likelihood;
            valid[i] = row.valid;
            if let Some(bg) = background.as_mut() {
                bg[i] = row.background;
            }
        }

        Responsibilities {
            component,
            background,
            log_terms,
            log_likelihood,
            valid,
        }
    }

    fn evaluate_row(
        &self,
        model: &MixtureModel,
        x: ArrayView1<'_, f64>,
        mask: ArrayView1<'_, bool>,
    ) -> RowPosterior {
        let k = model.n_components();
        let m = model.n_features();
        let observed: Vec<usize> = (0..m).filter(|&d| mask[d]).collect();
        if observed.is_empty() {
            return RowPosterior {
                log_terms: vec![f64::NEG_INFINITY; k],
                resp: vec![0.0; k],
                background: 0.0,
                log_likelihood: f64::NEG_INFINITY,
                valid: false,
            };
        }

        let complete = observed.len() == m;
        let mut diff = Array1::<f64>::zeros(observed.len());
        let log_terms: Vec<f64> = (0..k)
            .map(|c| {
                let mean = model.means.row(c);
                for (slot, &d) in diff.iter_mut().zip(&observed) {
                    *slot = x[d] - mean[d];
                }
                let log_density = if complete {
                    log_gaussian(self.chol[c].view(), self.log_det[c], &diff).ok()
                } else {
                    // A principal submatrix of a positive definite matrix is positive definite
                    sub_cholesky(model.covariances.index_axis(Axis(0), c), &observed)
                        .ok()
                        .and_then(|l| log_gaussian(l.view(), log_det(l.view()), &diff).ok())
                };
                self.log_weights[c] + log_density.unwrap_or(f64::NEG_INFINITY)
            })
            .collect();

        let background_term = match (self.log_background_weight, model.background.as_ref()) {
            (Some(lw), Some(bg)) => lw + bg.row_log_density(mask),
            _ => f64::NEG_INFINITY,
        };

        let max = log_terms
            .iter()
            .copied()
            .fold(background_term, f64::max);
        if !max.is_finite() {
            return RowPosterior {
                log_terms,
                resp: vec![0.0; k],
                background: 0.0,
                log_likelihood: f64::NEG_INFINITY,
                valid: true,
            };
        }

        // Normalise shifted exponentials directly so exact ties stay exact
        let shifted: Vec<f64> = log_terms.iter().map(|&l| (l - max).exp()).collect();
        let background_shifted = (background_term - max).exp();
        let total = shifted.iter().sum::<f64>() + background_shifted;
        RowPosterior {
            resp: shifted.iter().map(|&e| e / total).collect(),
            background: background_shifted / total,
            log_likelihood: max + total.ln(),
            log_terms,
            valid: true,
        }
    }
}
