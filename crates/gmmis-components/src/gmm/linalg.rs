use std::f64::consts::TAU;

use ndarray::prelude::*;
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Cholesky, Diag, Eigh, SolveTriangular, UPLO};
use thiserror::Error;

/// Smallest Cholesky pivot accepted before a covariance is treated as singular.
pub const COVARIANCE_FLOOR: f64 = 1e-12;

/// Why a covariance could not be factorized.
#[derive(Debug, Error)]
pub(crate) enum FactorError {
    #[error("covariance has non-finite entries")]
    NonFinite,
    #[error("covariance pivot {0:e} is at or below the singularity floor")]
    BelowFloor(f64),
    #[error("covariance is not positive definite: {0}")]
    Linalg(#[from] LinalgError),
}

/// Lower-triangular Cholesky factor of a symmetric matrix.
///
/// Fails if an entry is not finite, LAPACK rejects the matrix, or a squared pivot does not
/// exceed [`COVARIANCE_FLOOR`].
pub(crate) fn cholesky(a: ArrayView2<'_, f64>) -> Result<Array2<f64>, FactorError> {
    if a.iter().any(|v| !v.is_finite()) {
        return Err(FactorError::NonFinite);
    }
    let l = a.cholesky(UPLO::Lower)?;
    match l.diag().iter().map(|p| p * p).find(|&pivot| pivot <= COVARIANCE_FLOOR) {
        Some(pivot) => Err(FactorError::BelowFloor(pivot)),
        None => Ok(l),
    }
}

/// Cholesky factor of the sub-covariance restricted to the `observed` dimensions.
pub(crate) fn sub_cholesky(cov: ArrayView2<'_, f64>, observed: &[usize]) -> Result<Array2<f64>, FactorError> {
    let sub = Array2::from_shape_fn((observed.len(), observed.len()), |(a, b)| {
        cov[[observed[a], observed[b]]]
    });
    cholesky(sub.view())
}

/// `ln |Σ|` from the Cholesky factor of `Σ`.
pub(crate) fn log_det(l: ArrayView2<'_, f64>) -> f64 {
    2.0 * l.diag().iter().map(|v| v.ln()).sum::<f64>()
}

/// Log-density of a multivariate normal evaluated at `mean + diff`.
///
/// `l` is the Cholesky factor of the covariance and `diff` has one entry per row of `l`.
pub(crate) fn log_gaussian(l: ArrayView2<'_, f64>, log_det: f64, diff: &Array1<f64>) -> Result<f64, LinalgError> {
    let y = l.solve_triangular(UPLO::Lower, Diag::NonUnit, diff)?;
    let maha = y.dot(&y);
    Ok(-0.5 * (diff.len() as f64 * TAU.ln() + log_det + maha))
}

/// Nearest positive semi-definite matrix to the symmetric `a` in the Frobenius norm.
///
/// Negative eigenvalues are clipped to zero. A matrix that is already positive semi-definite is
/// returned unchanged.
pub(crate) fn nearest_psd(a: ArrayView2<'_, f64>) -> Result<Array2<f64>, LinalgError> {
    let (eigenvalues, eigenvectors) = a.eigh(UPLO::Upper)?;
    if eigenvalues.iter().all(|&v| v >= 0.0) {
        return Ok(a.to_owned());
    }
    let clipped = eigenvalues.mapv(|v| v.max(0.0));
    let scaled = &eigenvectors * &clipped.insert_axis(Axis(0));
    let projected = scaled.dot(&eigenvectors.t());
    // Symmetrize away the rounding of the reconstruction
    Ok((&projected + &projected.t()) * 0.5)
}
