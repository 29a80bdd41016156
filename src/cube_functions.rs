use gmmis_components::cube::{self, Cube};
use gmmis_components::features;
use ndarray::{Array1, ArrayView3};
use numpy::{PyArray1, PyArray3, PyReadonlyArray1, PyReadonlyArray3};
use pyo3::prelude::*;

use crate::errors::to_py_err;

/// Builds a cube from NumPy arrays indexed (channel, row, column).
pub(crate) fn cube_from_arrays(
    data: ArrayView3<'_, f64>,
    spectral_axis: Array1<f64>,
    blank: Option<f64>,
) -> PyResult<Cube> {
    let cube = Cube::new(data.to_owned(), spectral_axis).map_err(to_py_err)?;
    Ok(match blank {
        Some(value) => cube.with_blank(value),
        None => cube,
    })
}

/// Keeps the channels whose spectral coordinate lies in `[vel_min, vel_max]`.
///
/// # Arguments
///
/// * `data` - Cube indexed (channel, row, column).
/// * `spectral_axis` - One spectral coordinate per channel.
/// * `vel_min`, `vel_max` - Inclusive spectral bounds.
///
/// # Returns
///
/// * The chopped cube and its spectral axis.
#[pyfunction]
pub fn chop_cube<'py>(
    py: Python<'py>,
    data: PyReadonlyArray3<'py, f64>,
    spectral_axis: PyReadonlyArray1<'py, f64>,
    vel_min: f64,
    vel_max: f64,
) -> PyResult<(Bound<'py, PyArray3<f64>>, Bound<'py, PyArray1<f64>>)> {
    let cube = cube_from_arrays(data.as_array(), spectral_axis.as_array().to_owned(), None)?;
    let chopped = cube::chop_cube(vel_min, vel_max, &cube).map_err(to_py_err)?;
    Ok((
        PyArray3::from_owned_array(py, chopped.data().to_owned()),
        PyArray1::from_owned_array(py, chopped.spectral_axis().to_owned()),
    ))
}

/// Flags samples that are finite and differ from `blank`.
#[pyfunction]
#[pyo3(signature = (data, blank=None))]
pub fn mask_invalid<'py>(
    py: Python<'py>,
    data: PyReadonlyArray3<'py, f64>,
    blank: Option<f64>,
) -> PyResult<Bound<'py, PyArray3<bool>>> {
    let data = data.as_array();
    let cube = cube_from_arrays(data, Array1::zeros(data.dim().0), blank)?;
    Ok(PyArray3::from_owned_array(py, features::mask_invalid(&cube)))
}

/// Masks every spectrum whose peak lies below `rms_threshold` times the cube noise.
#[pyfunction]
pub fn apply_rms_filter<'py>(
    py: Python<'py>,
    data: PyReadonlyArray3<'py, f64>,
    mask: PyReadonlyArray3<'py, bool>,
    rms_threshold: f64,
) -> PyResult<Bound<'py, PyArray3<bool>>> {
    let data = data.as_array();
    let cube = cube_from_arrays(data, Array1::zeros(data.dim().0), None)?;
    let mask = mask.as_array().to_owned();
    let filtered = features::apply_rms_filter(&cube, &mask, rms_threshold).map_err(to_py_err)?;
    Ok(PyArray3::from_owned_array(py, filtered))
}
