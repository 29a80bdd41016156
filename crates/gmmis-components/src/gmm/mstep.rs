use ndarray::prelude::*;
use rayon::prelude::*;

use super::estep::Responsibilities;
use super::linalg::nearest_psd;
use super::{MixtureModel, WEIGHT_FLOOR};
use crate::features::FeatureMatrix;

/// Rows per partial sum. Fixed so the merge order, and hence every floating-point result, does
/// not depend on the number of workers.
const CHUNK_ROWS: usize = 256;

pub(crate) trait Accumulate: Send {
    fn merge(&mut self, other: &Self);
}

/// Sums per-row contributions in parallel fixed-size chunks, then merges the chunks in order.
pub(crate) fn chunked_sum<S, Z, F>(n_rows: usize, zero: Z, add_row: F) -> S
where
    S: Accumulate,
    Z: Fn() -> S + Sync,
    F: Fn(&mut S, usize) + Sync,
{
    let partials: Vec<S> = (0..n_rows.div_ceil(CHUNK_ROWS))
        .into_par_iter()
        .map(|chunk| {
            let mut acc = zero();
            let end = ((chunk + 1) * CHUNK_ROWS).min(n_rows);
            for i in chunk * CHUNK_ROWS..end {
                add_row(&mut acc, i);
            }
            acc
        })
        .collect();
    partials.iter().fold(zero(), |mut total, part| {
        total.merge(part);
        total
    })
}

/// Responsibility-weighted first moments over the unmasked entries.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct MeanStats {
    pub mass: Array1<f64>,
    pub background_mass: f64,
    /// K x M sums of `r_ik` over rows where feature d is valid.
    pub weight: Array2<f64>,
    /// K x M sums of `r_ik x_id` over rows where feature d is valid.
    pub sum: Array2<f64>,
}

impl MeanStats {
    pub fn zeros(k: usize, m: usize) -> Self {
        MeanStats {
            mass: Array1::zeros(k),
            background_mass: 0.0,
            weight: Array2::zeros((k, m)),
            sum: Array2::zeros((k, m)),
        }
    }

    pub fn add_row(
        &mut self,
        x: ArrayView1<'_, f64>,
        mask: ArrayView1<'_, bool>,
        resp: ArrayView1<'_, f64>,
        background: f64,
    ) {
        self.background_mass += background;
        for (c, &r) in resp.iter().enumerate() {
            if r == 0.0 {
                continue;
            }
            self.mass[c] += r;
            for (d, &valid) in mask.iter().enumerate() {
                if valid {
                    self.weight[[c, d]] += r;
                    self.sum[[c, d]] += r * x[d];
                }
            }
        }
    }
}

impl Accumulate for MeanStats {
    fn merge(&mut self, other: &Self) {
        self.mass += &other.mass;
        self.background_mass += other.background_mass;
        self.weight += &other.weight;
        self.sum += &other.sum;
    }
}

/// Responsibility-weighted pairwise second moments about the updated means.
///
/// Entry (d, e) only sees rows where both features are valid. Only the upper triangle is filled.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CovStats {
    pub weight: Array3<f64>,
    pub sum: Array3<f64>,
}

impl CovStats {
    pub fn zeros(k: usize, m: usize) -> Self {
        CovStats {
            weight: Array3::zeros((k, m, m)),
            sum: Array3::zeros((k, m, m)),
        }
    }

    pub fn add_row(
        &mut self,
        x: ArrayView1<'_, f64>,
        mask: ArrayView1<'_, bool>,
        resp: ArrayView1<'_, f64>,
        means: ArrayView2<'_, f64>,
    ) {
        let observed: Vec<usize> = (0..mask.len()).filter(|&d| mask[d]).collect();
        for (c, &r) in resp.iter().enumerate() {
            if r == 0.0 {
                continue;
            }
            let dev: Vec<f64> = observed.iter().map(|&d| x[d] - means[[c, d]]).collect();
            for (a, &d) in observed.iter().enumerate() {
                for (b, &e) in observed.iter().enumerate().skip(a) {
                    self.weight[[c, d, e]] += r;
                    self.sum[[c, d, e]] += r * dev[a] * dev[b];
                }
            }
        }
    }
}

impl Accumulate for CovStats {
    fn merge(&mut self, other: &Self) {
        self.weight += &other.weight;
        self.sum += &other.sum;
    }
}

pub(crate) struct MStepOutcome {
    pub model: MixtureModel,
    /// Components whose share of the valid rows fell below [`WEIGHT_FLOOR`].
    pub collapsed: Vec<usize>,
}

/// Updates weights, means, covariances and the background amplitude from `resp`.
///
/// Covariance entries are available-case estimates. Entries without any supporting data keep
/// their previous value (off-diagonal covariances drop to zero). Each covariance is then moved to
/// the nearest positive semi-definite matrix and `reg_covar` is added to its diagonal.
pub(crate) fn maximize(
    matrix: &FeatureMatrix,
    resp: &Responsibilities,
    previous: &MixtureModel,
    reg_covar: f64,
) -> MStepOutcome {
    let (k, m) = previous.means.dim();
    let values = matrix.values();
    let mask = matrix.mask();
    let n_valid = resp.n_valid().max(1) as f64;

    let first = chunked_sum(
        matrix.n_rows(),
        || MeanStats::zeros(k, m),
        |acc, i| {
            if resp.valid[i] {
                let background = resp.background.as_ref().map_or(0.0, |bg| bg[i]);
                acc.add_row(values.row(i), mask.row(i), resp.component.row(i), background);
            }
        },
    );

    let mut means = previous.means.clone();
    for ((mean, &w), &s) in means.iter_mut().zip(&first.weight).zip(&first.sum) {
        if w > 0.0 {
            *mean = s / w;
        }
    }

    let second = chunked_sum(
        matrix.n_rows(),
        || CovStats::zeros(k, m),
        |acc, i| {
            if resp.valid[i] {
                acc.add_row(values.row(i), mask.row(i), resp.component.row(i), means.view());
            }
        },
    );

    let mut covariances = Array3::<f64>::zeros((k, m, m));
    for (c, mut cov) in covariances.outer_iter_mut().enumerate() {
        for d in 0..m {
            for e in d..m {
                let w = second.weight[[c, d, e]];
                let value = if w > 0.0 {
                    second.sum[[c, d, e]] / w
                } else if d == e {
                    previous.covariances[[c, d, d]]
                } else {
                    0.0
                };
                cov[[d, e]] = value;
                cov[[e, d]] = value;
            }
        }
        // Entries estimated from different row subsets need not form a PSD matrix
        match nearest_psd(cov.view()) {
            Ok(projected) => cov.assign(&projected),
            Err(err) => log::debug!("fit_model: covariance {c} left unprojected: {err}"),
        }
        cov.diag_mut().mapv_inplace(|v| v + reg_covar);
    }

    let collapsed: Vec<usize> = (0..k)
        .filter(|&c| first.mass[c] / n_valid < WEIGHT_FLOOR)
        .collect();
    let total_mass = first.mass.sum();
    let weights = if total_mass > 0.0 {
        &first.mass / total_mass
    } else {
        previous.weights.clone()
    };

    let background = previous.background.as_ref().map(|bg| {
        let mut bg = bg.clone();
        bg.amplitude = (first.background_mass / n_valid).clamp(0.0, 1.0);
        bg
    });

    MStepOutcome {
        model: MixtureModel {
            weights,
            means,
            covariances,
            background,
        },
        collapsed,
    }
}
