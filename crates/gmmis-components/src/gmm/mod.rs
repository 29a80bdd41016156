//! Missing-data-aware expectation-maximization for Gaussian mixtures.
//!
//! Every row of the feature matrix contributes only through its unmasked features. Fully masked
//! rows contribute nothing. An optional uniform background component absorbs outliers.
pub mod estep;
mod init;
pub(crate) mod linalg;
mod mstep;

use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::features::FeatureMatrix;
use crate::{in_worker_pool, GmmError, Result, VSMALL};

pub use estep::{responsibilities, Responsibilities};
pub use linalg::COVARIANCE_FLOOR;

use estep::PreparedModel;
use init::Seeder;

/// Fraction of the valid rows below which a component counts as collapsed.
pub const WEIGHT_FLOOR: f64 = 1e-10;

/// Starting amplitude of the background component when it is enabled.
const BACKGROUND_INIT: f64 = 0.1;

/// Uniform density over the bounding box of the valid data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Background {
    /// Fraction of the total mixture mass carried by the background.
    pub amplitude: f64,
    /// `-ln(range_d)` for every feature `d`. A row's background log-density is the sum over its
    /// observed features.
    pub log_density: Array1<f64>,
}

impl Background {
    pub fn row_log_density(&self, mask: ArrayView1<'_, bool>) -> f64 {
        self.log_density
            .iter()
            .zip(mask)
            .filter(|&(_, &valid)| valid)
            .map(|(&ld, _)| ld)
            .sum()
    }
}

/// A fitted K-component Gaussian mixture over M features.
///
/// The density is `(1 - a) * sum_k w_k N(x | mu_k, Sigma_k) + a * U(x)`, where `a` is the
/// background amplitude (zero when there is no background).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MixtureModel {
    pub(crate) weights: Array1<f64>,
    pub(crate) means: Array2<f64>,
    pub(crate) covariances: Array3<f64>,
    pub(crate) background: Option<Background>,
}

impl MixtureModel {
    /// Assembles a model from explicit parameters.
    ///
    /// # Errors
    ///
    /// * `GmmError::Shape` if the parameter shapes disagree, a weight is negative, or the weights
    ///   do not sum to one.
    pub fn new(
        weights: Array1<f64>,
        means: Array2<f64>,
        covariances: Array3<f64>,
        background: Option<Background>,
    ) -> Result<Self> {
        let (k, m) = means.dim();
        if weights.len() != k || covariances.dim() != (k, m, m) {
            return Err(GmmError::shape(
                "mixture_model",
                format!(
                    "{} weights, means {:?} and covariances {:?} do not describe one mixture",
                    weights.len(),
                    means.dim(),
                    covariances.dim()
                ),
            ));
        }
        if let Some(bg) = &background {
            if bg.log_density.len() != m || !(0.0..=1.0).contains(&bg.amplitude) {
                return Err(GmmError::shape(
                    "mixture_model",
                    "background must have one log-density per feature and an amplitude in [0, 1]",
                ));
            }
        }
        let total = weights.sum();
        if weights.iter().any(|&w| w < 0.0) || (total - 1.0).abs() > 1e-6 {
            return Err(GmmError::shape(
                "mixture_model",
                format!("weights must be non-negative and sum to 1, got sum {total}"),
            ));
        }
        Ok(MixtureModel {
            weights,
            means,
            covariances,
            background,
        })
    }

    pub fn n_components(&self) -> usize {
        self.weights.len()
    }

    pub fn n_features(&self) -> usize {
        self.means.ncols()
    }

    pub fn weights(&self) -> ArrayView1<'_, f64> {
        self.weights.view()
    }

    pub fn means(&self) -> ArrayView2<'_, f64> {
        self.means.view()
    }

    pub fn covariances(&self) -> ArrayView3<'_, f64> {
        self.covariances.view()
    }

    pub fn background(&self) -> Option<&Background> {
        self.background.as_ref()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let model: MixtureModel = serde_json::from_str(text)?;
        MixtureModel::new(model.weights, model.means, model.covariances, model.background)
    }

    fn renormalize_weights(&mut self) {
        let total = self.weights.sum();
        if total > 0.0 {
            self.weights /= total;
        }
    }
}

/// How the initial component means are chosen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStrategy {
    /// Uniform random subsample of K distinct valid rows, drawn from the fit seed.
    RandomRows,
    /// Centres of a ceil(sqrt K) x ceil(K / ceil(sqrt K)) grid laid over the spatial extent, taken
    /// in raster order. A masked centre moves to the spatially nearest valid row.
    SpatialGrid,
    /// Caller-supplied K x M means.
    Means(Array2<f64>),
}

impl InitStrategy {
    /// Parses the configuration names `"random"` and `"grid"`.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "random" => Ok(InitStrategy::RandomRows),
            "grid" => Ok(InitStrategy::SpatialGrid),
            other => Err(GmmError::UnsupportedMethod {
                stage: "fit_model",
                kind: "initialization",
                name: other.to_string(),
                registered: "grid, random".to_string(),
            }),
        }
    }
}

/// Hyperparameters of a single fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitOptions {
    pub num_components: usize,
    pub background: bool,
    /// Relative change of the mean log-likelihood below which the fit is converged.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Added to every covariance diagonal after each update.
    pub reg_covar: f64,
    pub init: InitStrategy,
    pub seed: u64,
    /// Total number of component re-seeds allowed before the fit is abandoned.
    pub max_reseeds: usize,
    /// Worker count for the row-parallel steps. `None` uses the global rayon pool.
    pub threads: Option<usize>,
}

impl FitOptions {
    pub fn new(num_components: usize) -> Self {
        FitOptions {
            num_components,
            background: false,
            tolerance: 1e-6,
            max_iterations: 300,
            reg_covar: 1e-6,
            init: InitStrategy::RandomRows,
            seed: 0,
            max_reseeds: 10,
            threads: None,
        }
    }

    pub fn with_background(mut self, enabled: bool) -> Self {
        self.background = enabled;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_init(mut self, init: InitStrategy) -> Self {
        self.init = init;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }

    fn validate(&self, matrix: &FeatureMatrix) -> Result<()> {
        let config_error = |field: &'static str, reason: String| GmmError::Configuration {
            stage: "fit_model",
            field,
            reason,
        };
        if self.num_components == 0 {
            return Err(config_error("num_clusters", "must be at least 1".to_string()));
        }
        let n_valid = matrix.n_valid_rows();
        if n_valid < self.num_components {
            return Err(config_error(
                "num_clusters",
                format!(
                    "asks for {} components but only {n_valid} rows hold valid data",
                    self.num_components
                ),
            ));
        }
        if !(self.tolerance > 0.0) {
            return Err(config_error("tolerance", format!("must be positive, got {}", self.tolerance)));
        }
        if self.max_iterations == 0 {
            return Err(config_error("max_iterations", "must be at least 1".to_string()));
        }
        if !(self.reg_covar >= 0.0) {
            return Err(config_error("reg_covar", format!("must be non-negative, got {}", self.reg_covar)));
        }
        Ok(())
    }
}

/// Why the EM loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Converged,
    MaxIterations,
    /// Interrupted through the cancellation flag. The model is the best one evaluated so far.
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FitReport {
    pub model: MixtureModel,
    pub termination: Termination,
    /// Number of expectation steps performed.
    pub iterations: usize,
    /// Mean log-likelihood per valid row of the returned model.
    pub log_likelihood: f64,
    pub history: Vec<f64>,
    pub reseeds: usize,
}

impl FitReport {
    pub fn is_complete(&self) -> bool {
        self.termination != Termination::Cancelled
    }
}

/// Fits a Gaussian mixture to the valid entries of `matrix`.
///
/// See [`fit_with_cancel`] for the termination rules.
pub fn fit(matrix: &FeatureMatrix, options: &FitOptions) -> Result<FitReport> {
    fit_with_cancel(matrix, options, &AtomicBool::new(false))
}

/// Fits a Gaussian mixture, checking `cancel` between iterations.
///
/// The fit alternates expectation and maximization steps until the relative change in mean
/// log-likelihood falls below `options.tolerance` or `options.max_iterations` expectation steps
/// have run. A degenerate component (singular covariance or vanishing weight) is re-seeded from
/// a random valid row. Every re-seed counts against `options.max_reseeds`.
///
/// # Returns
///
/// * A [`FitReport`]. If `cancel` was raised, the report carries the best model evaluated so far
///   and [`Termination::Cancelled`].
///
/// # Errors
///
/// * `GmmError::Configuration` for invalid hyperparameters or too few valid rows.
/// * `GmmError::Shape` if explicit initial means do not match the matrix.
/// * `GmmError::FitDiverged` once the re-seed budget is exhausted.
pub fn fit_with_cancel(
    matrix: &FeatureMatrix,
    options: &FitOptions,
    cancel: &AtomicBool,
) -> Result<FitReport> {
    options.validate(matrix)?;
    in_worker_pool(options.threads, || run_em(matrix, options, cancel))?
}

fn run_em(matrix: &FeatureMatrix, options: &FitOptions, cancel: &AtomicBool) -> Result<FitReport> {
    let mut seeder = Seeder::new(matrix, options.seed, options.reg_covar);
    let mut model = seeder.initial_model(matrix, options)?;
    if options.background {
        model.background = Some(seeder.background(BACKGROUND_INIT));
    }

    let mut reseeds = 0usize;
    let mut history: Vec<f64> = Vec::new();
    let mut best: Option<(f64, MixtureModel)> = None;
    let mut previous: Option<f64> = None;
    let mut iteration = 0usize;

    let termination = loop {
        if cancel.load(Ordering::Relaxed) {
            log::warn!("fit_model: cancelled after {iteration} iterations");
            break Termination::Cancelled;
        }
        iteration += 1;

        // E-step, re-seeding any component whose covariance cannot be factorized
        let resp = loop {
            match PreparedModel::new(&model, iteration) {
                Ok(prepared) => break prepared.responsibilities(&model, matrix),
                Err(GmmError::DegenerateFit {
                    component, reason, ..
                }) => {
                    reseed(&mut seeder, &mut model, matrix, component, &reason, &mut reseeds, options, iteration, &history)?;
                    previous = None;
                }
                Err(other) => return Err(other),
            }
        };

        let ll = resp.mean_log_likelihood();
        history.push(ll);
        log::debug!("fit_model: iteration {iteration} mean log-likelihood {ll:.6}");
        if best.as_ref().map_or(true, |(b, _)| ll > *b) {
            best = Some((ll, model.clone()));
        }

        if let Some(prev) = previous {
            if ((ll - prev) / prev.abs().max(VSMALL)).abs() < options.tolerance {
                break Termination::Converged;
            }
        }
        if iteration >= options.max_iterations {
            break Termination::MaxIterations;
        }
        previous = Some(ll);

        let outcome = mstep::maximize(matrix, &resp, &model, options.reg_covar);
        model = outcome.model;
        for component in outcome.collapsed {
            let reason = "weight collapsed to zero".to_string();
            reseed(&mut seeder, &mut model, matrix, component, &reason, &mut reseeds, options, iteration, &history)?;
            previous = None;
        }
    };

    let (model, log_likelihood) = match termination {
        Termination::Cancelled => match best {
            Some((ll, best_model)) => (best_model, ll),
            None => (model, f64::NAN),
        },
        _ => {
            let ll = history.last().copied().unwrap_or(f64::NAN);
            (model, ll)
        }
    };

    log::info!(
        "fit_model: {:?} after {iteration} iterations, mean log-likelihood {log_likelihood:.6}, {reseeds} re-seeds",
        termination
    );
    Ok(FitReport {
        model,
        termination,
        iterations: history.len(),
        log_likelihood,
        history,
        reseeds,
    })
}

#[allow(clippy::too_many_arguments)]
fn reseed(
    seeder: &mut Seeder,
    model: &mut MixtureModel,
    matrix: &FeatureMatrix,
    component: usize,
    reason: &str,
    reseeds: &mut usize,
    options: &FitOptions,
    iteration: usize,
    history: &[f64],
) -> Result<()> {
    if *reseeds >= options.max_reseeds {
        return Err(GmmError::FitDiverged {
            iterations: iteration,
            reseeds: *reseeds,
            log_likelihood: history.last().copied().unwrap_or(f64::NAN),
        });
    }
    *reseeds += 1;
    log::warn!(
        "fit_model: {}; re-seeding ({}/{})",
        GmmError::DegenerateFit {
            component,
            iteration,
            reason: reason.to_string(),
        },
        reseeds,
        options.max_reseeds
    );
    seeder.reseed(model, matrix, component);
    Ok(())
}
