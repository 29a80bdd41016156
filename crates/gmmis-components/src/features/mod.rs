pub mod strategies;

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cube::Cube;
use crate::{GmmError, Result};

pub use strategies::{NormalizationRegistry, NormalizeFn, ReduceFn, ReductionRegistry};

/// Scale factor turning a median absolute deviation into a Gaussian standard deviation.
const MAD_TO_SIGMA: f64 = 1.4826;

/// Spatial extent of a chopped cube and the fixed row-major flattening of its pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpatialShape {
    pub rows: usize,
    pub cols: usize,
}

impl SpatialShape {
    pub fn new(rows: usize, cols: usize) -> Self {
        SpatialShape { rows, cols }
    }

    /// Number of spatial points.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn flat_index(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    /// Inverse of [`SpatialShape::flat_index`].
    #[inline]
    pub fn coords(&self, index: usize) -> (usize, usize) {
        (index / self.cols, index % self.cols)
    }
}

/// An N x M table of spectra (one row per spatial point, one column per feature) with a
/// validity mask of the same shape.
///
/// Every invalid cell holds NaN so a masked sample can never pass for a physical value.
#[derive(Clone, Debug)]
pub struct FeatureMatrix {
    values: Array2<f64>,
    mask: Array2<bool>,
    shape: SpatialShape,
}

impl FeatureMatrix {
    /// Builds a matrix from values and an explicit validity mask (`true` = valid).
    ///
    /// # Errors
    ///
    /// * `GmmError::Shape` if the mask and values disagree or the row count is not `shape.len()`.
    pub fn new(mut values: Array2<f64>, mask: Array2<bool>, shape: SpatialShape) -> Result<Self> {
        if values.dim() != mask.dim() {
            return Err(GmmError::shape(
                "feature_matrix",
                format!("values are {:?} but mask is {:?}", values.dim(), mask.dim()),
            ));
        }
        if values.nrows() != shape.len() {
            return Err(GmmError::shape(
                "feature_matrix",
                format!(
                    "{} rows cannot be laid out on a {}x{} spatial grid",
                    values.nrows(),
                    shape.rows,
                    shape.cols
                ),
            ));
        }
        let mask = &mask & &values.mapv(f64::is_finite);
        values.zip_mut_with(&mask, |v, &valid| {
            if !valid {
                *v = f64::NAN;
            }
        });
        Ok(FeatureMatrix { values, mask, shape })
    }

    /// Builds a matrix whose mask is derived from the finiteness of `values`.
    pub fn from_values(values: Array2<f64>, shape: SpatialShape) -> Result<Self> {
        let mask = values.mapv(f64::is_finite);
        Self::new(values, mask, shape)
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn mask(&self) -> ArrayView2<'_, bool> {
        self.mask.view()
    }

    pub fn shape(&self) -> SpatialShape {
        self.shape
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.values.ncols()
    }

    /// Whether row `i` has no valid sample at all.
    pub fn row_is_empty(&self, i: usize) -> bool {
        !self.mask.row(i).iter().any(|&m| m)
    }

    pub fn n_valid_rows(&self) -> usize {
        (0..self.n_rows()).filter(|&i| !self.row_is_empty(i)).count()
    }

    /// Returns a copy with the listed `(row, feature)` cells masked as well.
    pub fn with_masked_cells<I>(&self, cells: I) -> Self
    where
        I: IntoIterator<Item = (usize, usize)>,
    {
        let mut out = self.clone();
        for (i, d) in cells {
            out.mask[[i, d]] = false;
            out.values[[i, d]] = f64::NAN;
        }
        out
    }

    /// Replaces the values while keeping every previously masked cell masked.
    pub(crate) fn replace_values(self, values: Array2<f64>) -> Result<Self> {
        if values.dim() != self.values.dim() {
            return Err(GmmError::shape(
                "normalize",
                format!(
                    "strategy returned {:?} for a {:?} matrix",
                    values.dim(),
                    self.values.dim()
                ),
            ));
        }
        FeatureMatrix::new(values, self.mask, self.shape)
    }
}

/// Flags every sample of the cube that can be used for fitting.
///
/// A sample is invalid if it is not finite or equals the cube's blank sentinel. Data values are
/// never altered.
///
/// # Returns
///
/// * A boolean volume of the cube's shape, `true` where the sample is valid.
pub fn mask_invalid(cube: &Cube) -> Array3<bool> {
    let blank = cube.blank();
    cube.data()
        .mapv(|v| v.is_finite() && blank.map_or(true, |b| v != b))
}

/// Masks every spatial pixel whose brightest valid channel lies below `rms_threshold` times
/// the noise rms of the cube.
///
/// The noise is estimated from all valid samples as 1.4826 times their median absolute
/// deviation. If the cube has no valid sample or zero spread, the mask is returned unchanged.
///
/// # Arguments
///
/// * `cube` - The chopped cube.
/// * `mask` - Validity mask from [`mask_invalid`].
/// * `rms_threshold` - Detection threshold in units of the noise rms.
pub fn apply_rms_filter(cube: &Cube, mask: &Array3<bool>, rms_threshold: f64) -> Result<Array3<bool>> {
    let data = cube.data();
    if data.dim() != mask.dim() {
        return Err(GmmError::shape(
            "rms_filter",
            format!("cube is {:?} but mask is {:?}", data.dim(), mask.dim()),
        ));
    }

    let mut samples: Vec<f64> = data
        .iter()
        .zip(mask.iter())
        .filter(|&(_, &valid)| valid)
        .map(|(&v, _)| v)
        .collect();
    let Some(center) = median(&mut samples) else {
        log::warn!("rms_filter: cube holds no valid samples, nothing to filter");
        return Ok(mask.clone());
    };
    let mut deviations: Vec<f64> = samples.iter().map(|v| (v - center).abs()).collect();
    let rms = MAD_TO_SIGMA * median(&mut deviations).unwrap_or(0.0);
    if rms <= 0.0 {
        log::warn!("rms_filter: noise estimate is zero, nothing to filter");
        return Ok(mask.clone());
    }

    let cutoff = rms_threshold * rms;
    let (_, rows, cols) = data.dim();
    let mut filtered = mask.clone();
    let mut dropped = 0usize;
    for r in 0..rows {
        for c in 0..cols {
            let peak = data
                .slice(s![.., r, c])
                .iter()
                .zip(mask.slice(s![.., r, c]))
                .filter(|&(_, &valid)| valid)
                .map(|(&v, _)| v)
                .fold(f64::NEG_INFINITY, f64::max);
            if peak < cutoff {
                filtered.slice_mut(s![.., r, c]).fill(false);
                dropped += 1;
            }
        }
    }
    log::info!(
        "rms_filter: noise rms {rms:.4e}, masked {dropped} of {} spectra below {rms_threshold} rms",
        rows * cols
    );
    Ok(filtered)
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len();
    let mid = n / 2;
    let (lower, upper, _) = values.select_nth_unstable_by(mid, f64::total_cmp);
    let upper = *upper;
    if n % 2 == 1 {
        Some(upper)
    } else {
        let below = lower.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(0.5 * (below + upper))
    }
}
