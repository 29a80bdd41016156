use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{GmmError, Result};

/// Coordinate values along the two spatial axes of a cube.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpatialAxes {
    pub row_coords: Array1<f64>,
    pub col_coords: Array1<f64>,
}

impl SpatialAxes {
    /// Pixel-index coordinates for a `rows` x `cols` image.
    pub fn pixel(rows: usize, cols: usize) -> Self {
        SpatialAxes {
            row_coords: Array1::range(0.0, rows as f64, 1.0),
            col_coords: Array1::range(0.0, cols as f64, 1.0),
        }
    }
}

/// A spectral-line data cube indexed (channel, row, column).
///
/// The cube is immutable once built. Every transformation returns a new cube.
#[derive(Clone, Debug, PartialEq)]
pub struct Cube {
    data: Array3<f64>,
    spectral_axis: Array1<f64>,
    spatial: SpatialAxes,
    blank: Option<f64>,
}

impl Cube {
    /// Builds a cube with pixel-index spatial coordinates.
    ///
    /// # Errors
    ///
    /// Returns `GmmError::Shape` if `spectral_axis` does not have one value per channel.
    pub fn new(data: Array3<f64>, spectral_axis: Array1<f64>) -> Result<Self> {
        let (_, rows, cols) = data.dim();
        Self::with_spatial_axes(data, spectral_axis, SpatialAxes::pixel(rows, cols))
    }

    pub fn with_spatial_axes(
        data: Array3<f64>,
        spectral_axis: Array1<f64>,
        spatial: SpatialAxes,
    ) -> Result<Self> {
        let (nchan, rows, cols) = data.dim();
        if spectral_axis.len() != nchan {
            return Err(GmmError::shape(
                "cube",
                format!(
                    "spectral axis has {} values but the cube has {} channels",
                    spectral_axis.len(),
                    nchan
                ),
            ));
        }
        if spatial.row_coords.len() != rows || spatial.col_coords.len() != cols {
            return Err(GmmError::shape(
                "cube",
                format!(
                    "spatial axes are {}x{} but the cube is {}x{}",
                    spatial.row_coords.len(),
                    spatial.col_coords.len(),
                    rows,
                    cols
                ),
            ));
        }
        Ok(Cube {
            data,
            spectral_axis,
            spatial,
            blank: None,
        })
    }

    /// Marks `value` as the "no-data" sentinel of this cube.
    pub fn with_blank(mut self, value: f64) -> Self {
        self.blank = Some(value);
        self
    }

    pub fn data(&self) -> ArrayView3<'_, f64> {
        self.data.view()
    }

    pub fn spectral_axis(&self) -> ArrayView1<'_, f64> {
        self.spectral_axis.view()
    }

    pub fn spatial_axes(&self) -> &SpatialAxes {
        &self.spatial
    }

    pub fn blank(&self) -> Option<f64> {
        self.blank
    }

    pub fn n_channels(&self) -> usize {
        self.data.dim().0
    }

    /// Spatial extent as `(rows, cols)`.
    pub fn spatial_dim(&self) -> (usize, usize) {
        let (_, rows, cols) = self.data.dim();
        (rows, cols)
    }
}

/// Restricts a cube to the channels whose spectral coordinate lies in `[vel_min, vel_max]`.
///
/// Both bounds are inclusive. Channel order and the full spatial extent are preserved, so the
/// routine works for ascending as well as descending spectral axes.
///
/// # Arguments
///
/// * `vel_min`, `vel_max` - Physical bounds along the spectral axis (e.g. km/s).
/// * `cube` - Source cube. It is not modified.
///
/// # Returns
///
/// * A new cube holding a copy of the selected channels.
///
/// # Errors
///
/// * `GmmError::Range` if `vel_min > vel_max`, if either bound is not finite, or if no channel
///   falls inside the range.
pub fn chop_cube(vel_min: f64, vel_max: f64, cube: &Cube) -> Result<Cube> {
    let range_error = |reason: &str| GmmError::Range {
        stage: "chop_cube",
        min: vel_min,
        max: vel_max,
        reason: reason.to_string(),
    };
    if !vel_min.is_finite() || !vel_max.is_finite() {
        return Err(range_error("bounds must be finite"));
    }
    if vel_min > vel_max {
        return Err(range_error("minimum exceeds maximum"));
    }

    let channels: Vec<usize> = cube
        .spectral_axis
        .iter()
        .enumerate()
        .filter(|&(_, &v)| v >= vel_min && v <= vel_max)
        .map(|(i, _)| i)
        .collect();
    if channels.is_empty() {
        return Err(range_error("no channel of the spectral axis falls inside the range"));
    }

    log::debug!(
        "chop_cube: keeping {} of {} channels in [{vel_min}, {vel_max}]",
        channels.len(),
        cube.n_channels()
    );

    Ok(Cube {
        data: cube.data.select(Axis(0), &channels),
        spectral_axis: cube.spectral_axis.select(Axis(0), &channels),
        spatial: cube.spatial.clone(),
        blank: cube.blank,
    })
}
