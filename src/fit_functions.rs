use gmmis_components::domain;
use gmmis_components::features::{FeatureMatrix, SpatialShape};
use gmmis_components::gmm::{self, FitOptions, InitStrategy, MixtureModel, Termination};
use itertools::Itertools;
use numpy::{PyArray1, PyArray2, PyArray3, PyReadonlyArray2};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::errors::to_py_err;

/// A fitted Gaussian mixture, as seen from Python.
#[pyclass(name = "MixtureModel", frozen)]
#[derive(Clone)]
pub struct PyMixtureModel {
    pub inner: MixtureModel,
}

impl From<MixtureModel> for PyMixtureModel {
    fn from(inner: MixtureModel) -> Self {
        PyMixtureModel { inner }
    }
}

#[pymethods]
impl PyMixtureModel {
    #[getter]
    fn n_components(&self) -> usize {
        self.inner.n_components()
    }

    #[getter]
    fn n_features(&self) -> usize {
        self.inner.n_features()
    }

    #[getter]
    fn weights<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        PyArray1::from_owned_array(py, self.inner.weights().to_owned())
    }

    #[getter]
    fn means<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray2<f64>> {
        PyArray2::from_owned_array(py, self.inner.means().to_owned())
    }

    #[getter]
    fn covariances<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray3<f64>> {
        PyArray3::from_owned_array(py, self.inner.covariances().to_owned())
    }

    /// Fraction of the mass in the uniform background, or `None` without one.
    #[getter]
    fn background_amplitude(&self) -> Option<f64> {
        self.inner.background().map(|bg| bg.amplitude)
    }

    fn to_json(&self) -> PyResult<String> {
        self.inner.to_json().map_err(to_py_err)
    }

    #[staticmethod]
    fn from_json(text: &str) -> PyResult<Self> {
        MixtureModel::from_json(text)
            .map(PyMixtureModel::from)
            .map_err(to_py_err)
    }

    fn __repr__(&self) -> String {
        format!(
            "MixtureModel(n_components={}, n_features={}, weights=[{}])",
            self.inner.n_components(),
            self.inner.n_features(),
            self.inner.weights().iter().map(|w| format!("{w:.3}")).join(", ")
        )
    }
}

/// Wraps an N x M array as a feature matrix. Non-finite entries count as masked.
pub(crate) fn feature_matrix(
    features: &PyReadonlyArray2<'_, f64>,
    shape: Option<(usize, usize)>,
) -> PyResult<FeatureMatrix> {
    let values = features.as_array().to_owned();
    let (rows, cols) = shape.unwrap_or((values.nrows(), 1));
    FeatureMatrix::from_values(values, SpatialShape::new(rows, cols)).map_err(to_py_err)
}

pub(crate) fn termination_name(termination: Termination) -> &'static str {
    match termination {
        Termination::Converged => "converged",
        Termination::MaxIterations => "max_iterations",
        Termination::Cancelled => "cancelled",
    }
}

/// Fits a Gaussian mixture to the finite entries of an N x M feature array.
///
/// # Arguments
///
/// * `features` - One row per spatial point. NaN entries are treated as missing.
/// * `num_clusters` - Number of Gaussian components.
/// * `shape` - `(rows, cols)` of the image the rows were flattened from. Defaults to a column.
/// * `init` - `"random"` or `"grid"`.
///
/// # Returns
///
/// * The fitted model.
#[pyfunction]
#[pyo3(signature = (
    features,
    num_clusters,
    shape=None,
    background=false,
    seed=0,
    init="random",
    tolerance=None,
    max_iterations=None,
    threads=None,
))]
#[allow(clippy::too_many_arguments)]
pub fn fit_model<'py>(
    features: PyReadonlyArray2<'py, f64>,
    num_clusters: usize,
    shape: Option<(usize, usize)>,
    background: bool,
    seed: u64,
    init: &str,
    tolerance: Option<f64>,
    max_iterations: Option<usize>,
    threads: Option<usize>,
) -> PyResult<PyMixtureModel> {
    let matrix = feature_matrix(&features, shape)?;
    let mut options = FitOptions::new(num_clusters)
        .with_background(background)
        .with_seed(seed)
        .with_init(InitStrategy::from_name(init).map_err(to_py_err)?)
        .with_threads(threads);
    if let Some(tolerance) = tolerance {
        options = options.with_tolerance(tolerance);
    }
    if let Some(max_iterations) = max_iterations {
        options = options.with_max_iterations(max_iterations);
    }
    let report = gmm::fit(&matrix, &options).map_err(to_py_err)?;
    log::debug!(
        "fit_model: {} after {} iterations",
        termination_name(report.termination),
        report.iterations
    );
    Ok(report.model.into())
}

/// Labels every pixel of a `rows` x `cols` image with its most probable component.
///
/// # Returns
///
/// * The domain map (`-1` for unassigned pixels), the best log-likelihood per pixel, the
///   per-component log-likelihood layers and the sorted list of used components.
#[pyfunction]
#[pyo3(signature = (model, features, rows, cols, threshold=0.0))]
#[allow(clippy::type_complexity)]
pub fn make_domain_map<'py>(
    py: Python<'py>,
    model: &PyMixtureModel,
    features: PyReadonlyArray2<'py, f64>,
    rows: usize,
    cols: usize,
    threshold: f64,
) -> PyResult<(
    Bound<'py, PyArray2<i64>>,
    Bound<'py, PyArray2<f64>>,
    Bound<'py, PyArray3<f64>>,
    Vec<usize>,
)> {
    let matrix = feature_matrix(&features, Some((rows, cols)))?;
    if matrix.n_features() != model.inner.n_features() {
        return Err(PyErr::new::<PyValueError, _>(format!(
            "model has {} features but the array has {}",
            model.inner.n_features(),
            matrix.n_features()
        )));
    }
    let assignment = domain::assign(&model.inner, &matrix, threshold).map_err(to_py_err)?;
    Ok((
        PyArray2::from_owned_array(py, assignment.domain_map),
        PyArray2::from_owned_array(py, assignment.log_likelihood.best),
        PyArray3::from_owned_array(py, assignment.log_likelihood.layers),
        assignment.components,
    ))
}
