//! Turning a fitted mixture into a labelled spatial map.
use itertools::Itertools;
use ndarray::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::features::FeatureMatrix;
use crate::gmm::MixtureModel;
use crate::{in_worker_pool, GmmError, Result, UNASSIGNED};

pub use crate::gmm::{responsibilities, Responsibilities};

/// Per-pixel log-likelihoods that go with a domain map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogLikelihoodVolume {
    /// Weighted log-density of the most probable component. Negative infinity for pixels
    /// without valid data.
    pub best: Array2<f64>,
    /// K x rows x cols weighted log-densities of every component.
    pub layers: Array3<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainAssignment {
    /// Component index per pixel, or [`UNASSIGNED`].
    pub domain_map: Array2<i64>,
    pub log_likelihood: LogLikelihoodVolume,
    /// Sorted distinct component indices that label at least one pixel.
    pub components: Vec<usize>,
}

/// Assigns every spatial point to its most probable mixture component.
///
/// A point is labelled with `argmax_k r_ik` (ties go to the lower index) when that
/// responsibility is at least `threshold` and the background, if any, is not more probable.
/// Otherwise, and for points without a single valid feature, it is [`UNASSIGNED`].
///
/// This is pure inference. The model and the matrix are not modified.
///
/// # Arguments
///
/// * `model` - A fitted mixture.
/// * `matrix` - The feature matrix the map is built for. Its spatial shape sets the map shape.
/// * `threshold` - Minimum responsibility for an assignment.
///
/// # Errors
///
/// * `GmmError::Configuration` if `threshold` is NaN.
/// * `GmmError::Shape` if the model and matrix feature counts differ.
pub fn assign(model: &MixtureModel, matrix: &FeatureMatrix, threshold: f64) -> Result<DomainAssignment> {
    assign_with_threads(model, matrix, threshold, None)
}

/// [`assign`] on a dedicated pool of `threads` workers.
pub fn assign_with_threads(
    model: &MixtureModel,
    matrix: &FeatureMatrix,
    threshold: f64,
    threads: Option<usize>,
) -> Result<DomainAssignment> {
    if threshold.is_nan() {
        return Err(GmmError::Configuration {
            stage: "make_domain_map",
            field: "assignment_threshold",
            reason: "is NaN".to_string(),
        });
    }
    in_worker_pool(threads, || build_assignment(model, matrix, threshold))?
}

fn build_assignment(model: &MixtureModel, matrix: &FeatureMatrix, threshold: f64) -> Result<DomainAssignment> {
    let resp = responsibilities(model, matrix)?;
    let shape = matrix.shape();
    let k = model.n_components();

    let labels: Vec<(i64, f64)> = (0..matrix.n_rows())
        .into_par_iter()
        .map(|i| label_row(&resp, i, threshold))
        .collect();

    let mut domain_map = Array2::from_elem((shape.rows, shape.cols), UNASSIGNED);
    let mut best = Array2::from_elem((shape.rows, shape.cols), f64::NEG_INFINITY);
    let mut layers = Array3::from_elem((k, shape.rows, shape.cols), f64::NEG_INFINITY);
    for (i, &(label, ll)) in labels.iter().enumerate() {
        let (r, c) = shape.coords(i);
        domain_map[[r, c]] = label;
        best[[r, c]] = ll;
        for comp in 0..k {
            layers[[comp, r, c]] = resp.log_terms[[i, comp]];
        }
    }

    let components = labels
        .iter()
        .filter(|(label, _)| *label != UNASSIGNED)
        .map(|&(label, _)| label as usize)
        .sorted()
        .dedup()
        .collect_vec();

    log::info!(
        "make_domain_map: {} of {} pixels assigned to {} components",
        labels.iter().filter(|(label, _)| *label != UNASSIGNED).count(),
        labels.len(),
        components.len()
    );
    Ok(DomainAssignment {
        domain_map,
        log_likelihood: LogLikelihoodVolume { best, layers },
        components,
    })
}

/// Label and best-component log-likelihood of row `i`.
fn label_row(resp: &Responsibilities, i: usize, threshold: f64) -> (i64, f64) {
    if !resp.valid[i] {
        return (UNASSIGNED, f64::NEG_INFINITY);
    }
    let row = resp.component.row(i);
    let mut best_k = 0;
    for (c, &r) in row.iter().enumerate() {
        if r > row[best_k] {
            best_k = c;
        }
    }
    let best_r = row[best_k];
    let background = resp.background.as_ref().map_or(0.0, |bg| bg[i]);
    let ll = resp.log_terms[[i, best_k]];
    if best_r >= threshold && background <= best_r && ll.is_finite() {
        (best_k as i64, ll)
    } else {
        (UNASSIGNED, ll)
    }
}

/// Mean spectrum of the pixels assigned to each component.
///
/// Only valid samples are averaged. A component without any valid sample gets a row of NaN.
///
/// # Returns
///
/// * A K x M array, one averaged spectrum per component.
///
/// # Errors
///
/// * `GmmError::Shape` if the map does not match the matrix's spatial shape.
pub fn average_spectra(
    domain_map: ArrayView2<'_, i64>,
    matrix: &FeatureMatrix,
    n_components: usize,
) -> Result<Array2<f64>> {
    let shape = matrix.shape();
    if domain_map.dim() != (shape.rows, shape.cols) {
        return Err(GmmError::shape(
            "average_spectra",
            format!(
                "domain map is {:?} but the matrix covers {}x{}",
                domain_map.dim(),
                shape.rows,
                shape.cols
            ),
        ));
    }
    let m = matrix.n_features();
    let values = matrix.values();
    let mask = matrix.mask();
    let mut sum = Array2::<f64>::zeros((n_components, m));
    let mut count = Array2::<f64>::zeros((n_components, m));
    for ((r, c), &label) in domain_map.indexed_iter() {
        if label < 0 || label as usize >= n_components {
            continue;
        }
        let i = shape.flat_index(r, c);
        let k = label as usize;
        for d in 0..m {
            if mask[[i, d]] {
                sum[[k, d]] += values[[i, d]];
                count[[k, d]] += 1.0;
            }
        }
    }
    Ok(Array2::from_shape_fn((n_components, m), |(k, d)| {
        if count[[k, d]] > 0.0 {
            sum[[k, d]] / count[[k, d]]
        } else {
            f64::NAN
        }
    }))
}

/// Fraction of the assigned pixels that carry each component label.
pub fn domain_fractions(domain_map: ArrayView2<'_, i64>, n_components: usize) -> Array1<f64> {
    let mut counts = Array1::<f64>::zeros(n_components);
    for &label in domain_map.iter() {
        if label >= 0 && (label as usize) < n_components {
            counts[label as usize] += 1.0;
        }
    }
    let total = counts.sum();
    if total > 0.0 {
        counts / total
    } else {
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::SpatialShape;
    use crate::gmm::Background;

    fn unit_model(means: Array2<f64>, weights: Array1<f64>) -> MixtureModel {
        let (k, m) = means.dim();
        let covs = Array3::from_shape_fn((k, m, m), |(_, d, e)| if d == e { 1.0 } else { 0.0 });
        MixtureModel::new(weights, means, covs, None).unwrap()
    }

    #[test]
    fn test_map_inverts_flattening() {
        let model = unit_model(array![[0.0], [100.0]], array![0.5, 0.5]);
        let shape = SpatialShape::new(3, 4);
        // pixel (r, c) sits on component 1 iff r + c is even
        let values = Array2::from_shape_fn((12, 1), |(i, _)| {
            let (r, c) = shape.coords(i);
            if (r + c) % 2 == 0 { 100.0 } else { 0.0 }
        });
        let fm = FeatureMatrix::from_values(values, shape).unwrap();
        let out = assign(&model, &fm, 0.5).unwrap();
        assert_eq!(out.domain_map.dim(), (3, 4));
        for r in 0..3 {
            for c in 0..4 {
                let expected = if (r + c) % 2 == 0 { 1 } else { 0 };
                assert_eq!(out.domain_map[[r, c]], expected);
            }
        }
        assert_eq!(out.components, vec![0, 1]);
        assert_eq!(out.log_likelihood.layers.dim(), (2, 3, 4));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        // two identical components: every responsibility is exactly one half
        let model = unit_model(array![[1.0], [1.0]], array![0.5, 0.5]);
        let fm = FeatureMatrix::from_values(array![[0.3], [2.0]], SpatialShape::new(1, 2)).unwrap();
        let at = assign(&model, &fm, 0.5).unwrap();
        assert_eq!(at.domain_map, array![[0i64, 0]]);
        let above = assign(&model, &fm, 0.5 + 1e-12).unwrap();
        assert_eq!(above.domain_map, array![[UNASSIGNED, UNASSIGNED]]);
        assert!(above.components.is_empty());
        // the best-component likelihood is still reported for valid pixels
        assert!(above.log_likelihood.best[[0, 0]].is_finite());
    }

    #[test]
    fn test_fully_masked_pixel_is_unassigned() {
        let model = unit_model(array![[0.0, 0.0]], array![1.0]);
        let fm = FeatureMatrix::from_values(array![[0.1, 0.2], [f64::NAN, f64::NAN]], SpatialShape::new(2, 1))
            .unwrap();
        let out = assign(&model, &fm, 0.0).unwrap();
        assert_eq!(out.domain_map[[0, 0]], 0);
        assert_eq!(out.domain_map[[1, 0]], UNASSIGNED);
        assert_eq!(out.log_likelihood.best[[1, 0]], f64::NEG_INFINITY);
        assert_eq!(out.log_likelihood.layers[[0, 1, 0]], f64::NEG_INFINITY);
    }

    #[test]
    fn test_background_dominated_pixel_is_unassigned() {
        let mut model = unit_model(array![[0.0]], array![1.0]);
        model.background = Some(Background {
            amplitude: 0.5,
            log_density: array![-(10.0_f64.ln())],
        });
        let fm = FeatureMatrix::from_values(array![[0.0], [25.0]], SpatialShape::new(1, 2)).unwrap();
        let out = assign(&model, &fm, 0.0).unwrap();
        assert_eq!(out.domain_map, array![[0, UNASSIGNED]]);
    }

    #[test]
    fn test_assign_is_idempotent() {
        let model = unit_model(array![[0.0, 1.0], [4.0, 4.0]], array![0.3, 0.7]);
        let values = Array2::from_shape_fn((20, 2), |(i, d)| ((i * 3 + d) % 7) as f64 - 1.0);
        let fm = FeatureMatrix::from_values(values, SpatialShape::new(4, 5)).unwrap();
        let a = assign(&model, &fm, 0.6).unwrap();
        let b = assign_with_threads(&model, &fm, 0.6, Some(2)).unwrap();
        assert_eq!(a, b);
        assert!(matches!(assign(&model, &fm, f64::NAN), Err(GmmError::Configuration { .. })));
    }

    #[test]
    fn test_average_spectra_and_fractions() {
        let fm = FeatureMatrix::from_values(
            array![[1.0, 2.0], [3.0, f64::NAN], [10.0, 10.0], [7.0, 7.0]],
            SpatialShape::new(2, 2),
        )
        .unwrap();
        let dmap = array![[0, 0], [1, UNASSIGNED]];
        let spectra = average_spectra(dmap.view(), &fm, 3).unwrap();
        assert_eq!(spectra[[0, 0]], 2.0);
        assert_eq!(spectra[[0, 1]], 2.0);
        assert_eq!(spectra.row(1), array![10.0, 10.0]);
        assert!(spectra[[2, 0]].is_nan());

        let fractions = domain_fractions(dmap.view(), 3);
        assert!((fractions[0] - 2.0 / 3.0).abs() < 1e-12);
        assert!((fractions[1] - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(fractions[2], 0.0);

        assert!(average_spectra(array![[0]].view(), &fm, 1).is_err());
    }
}
