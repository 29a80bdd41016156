use std::sync::Once;

use gmmis_components::cube::Cube;
use gmmis_components::domain::DomainAssignment;
use gmmis_components::gmm::MixtureModel;
use gmmis_components::run::{self, ArtifactSink, RunOrchestrator, RunParams, Scalar, SpectraSummary};
use gmmis_components::{GmmError, Result};
use numpy::{PyReadonlyArray1, PyReadonlyArray3, ToPyArray};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyInt};

use crate::cube_functions::cube_from_arrays;
use crate::errors::to_py_err;
use crate::fit_functions::{termination_name, PyMixtureModel};

/// Reads `key` from `dict`. Missing keys and `None` both come back as `None`.
fn item<'py, T: FromPyObject<'py>>(dict: &Bound<'py, PyDict>, key: &str) -> PyResult<Option<T>> {
    match dict.get_item(key)? {
        Some(value) if !value.is_none() => Ok(Some(value.extract()?)),
        _ => Ok(None),
    }
}

/// Reads a number from `dict`, remembering whether Python held it as an int or a float.
fn scalar_item(dict: &Bound<'_, PyDict>, key: &str) -> PyResult<Option<Scalar>> {
    match dict.get_item(key)? {
        Some(value) if value.is_none() => Ok(None),
        Some(value) if value.is_instance_of::<PyInt>() => Ok(Some(Scalar::Int(value.extract()?))),
        Some(value) => Ok(Some(Scalar::Float(value.extract()?))),
        None => Ok(None),
    }
}

/// Builds run parameters from a Python dict. Unknown keys are ignored.
pub(crate) fn params_from_dict(dict: &Bound<'_, PyDict>) -> PyResult<RunParams> {
    Ok(RunParams {
        source_name: item(dict, "source_name")?,
        vel_min: scalar_item(dict, "vel_min")?,
        vel_max: scalar_item(dict, "vel_max")?,
        num_clusters: item(dict, "num_clusters")?,
        norm_method: item(dict, "norm_method")?,
        reduce_method: item(dict, "reduce_method")?,
        rms_threshold: scalar_item(dict, "rms_threshold")?,
        save_txt: item(dict, "save_txt")?,
        save_gmm: item(dict, "save_gmm")?,
        save_dmap: item(dict, "save_dmap")?,
        save_figs: item(dict, "save_figs")?,
        apply_rms_filter: item(dict, "apply_rms_filter")?,
        seed: item(dict, "seed")?,
        init: item(dict, "init")?,
        background: item(dict, "background")?,
        tolerance: item(dict, "tolerance")?,
        max_iterations: item(dict, "max_iterations")?,
        assignment_threshold: item(dict, "assignment_threshold")?,
        threads: item(dict, "threads")?,
    })
}

/// Forwards artifacts to whichever hook methods a Python object defines.
struct PySink<'py> {
    target: Option<Bound<'py, PyAny>>,
    /// The Python exception raised by the last failing hook.
    error: Option<PyErr>,
}

impl<'py> PySink<'py> {
    fn new(target: Option<Bound<'py, PyAny>>) -> Self {
        PySink { target, error: None }
    }

    fn dispatch<F>(&mut self, hook: &'static str, call: F) -> Result<()>
    where
        F: FnOnce(&Bound<'py, PyAny>) -> PyResult<Bound<'py, PyAny>>,
    {
        let Some(target) = self.target.clone() else {
            return Ok(());
        };
        let outcome = target.hasattr(hook).and_then(|present| {
            if present {
                call(&target).map(|_| ())
            } else {
                log::debug!("full_run: sink has no '{hook}' hook, skipping");
                Ok(())
            }
        });
        outcome.map_err(|err| {
            let reason = err.to_string();
            self.error = Some(err);
            GmmError::Collaborator { hook, reason }
        })
    }

    /// Turns a run error back into a Python exception, re-raising a hook's own exception.
    fn into_py_err(mut self, err: GmmError) -> PyErr {
        match (err, self.error.take()) {
            (GmmError::Collaborator { .. }, Some(original)) => original,
            (err, _) => to_py_err(err),
        }
    }
}

impl ArtifactSink for PySink<'_> {
    fn set_styles(&mut self) -> Result<()> {
        self.dispatch("set_styles", |t| t.call_method0("set_styles"))
    }

    fn save_model(&mut self, name: &str, model: &MixtureModel) -> Result<()> {
        self.dispatch("save_model", |t| {
            t.call_method1("save_model", (name, PyMixtureModel::from(model.clone())))
        })
    }

    fn save_domain_map(&mut self, name: &str, assignment: &DomainAssignment) -> Result<()> {
        self.dispatch("save_domain_map", |t| {
            let py = t.py();
            t.call_method1(
                "save_domain_map",
                (
                    name,
                    assignment.domain_map.to_pyarray(py),
                    assignment.log_likelihood.best.to_pyarray(py),
                    assignment.components.clone(),
                ),
            )
        })
    }

    fn plot_weights_map(&mut self, name: &str, model: &MixtureModel, assignment: &DomainAssignment) -> Result<()> {
        self.dispatch("plot_weights_map", |t| {
            let py = t.py();
            t.call_method1(
                "plot_weights_map",
                (name, model.weights().to_pyarray(py), assignment.domain_map.to_pyarray(py)),
            )
        })
    }

    fn plot_domain_map(&mut self, name: &str, cube: &Cube, assignment: &DomainAssignment) -> Result<()> {
        self.dispatch("plot_domain_map", |t| {
            let py = t.py();
            let axes = cube.spatial_axes();
            t.call_method1(
                "plot_domain_map",
                (
                    name,
                    assignment.domain_map.to_pyarray(py),
                    axes.row_coords.to_pyarray(py),
                    axes.col_coords.to_pyarray(py),
                ),
            )
        })
    }

    fn plot_average_spectra(&mut self, name: &str, summary: &SpectraSummary) -> Result<()> {
        self.dispatch("plot_average_spectra", |t| {
            let py = t.py();
            t.call_method1(
                "plot_average_spectra",
                (
                    name,
                    summary.spectral_axis.to_pyarray(py),
                    summary.spectra.to_pyarray(py),
                    summary.fractions.to_pyarray(py),
                ),
            )
        })
    }
}

/// Fills in `save_txt`, deriving it when it is `"none"`.
///
/// # Returns
///
/// * A copy of `params` with the resolved `save_txt`.
#[pyfunction]
pub fn save_check<'py>(params: &Bound<'py, PyDict>) -> PyResult<Bound<'py, PyDict>> {
    let checked = run::save_check(params_from_dict(params)?).map_err(to_py_err)?;
    let out = params.copy()?;
    out.set_item("save_txt", checked.save_txt)?;
    Ok(out)
}

/// Runs the whole pipeline on a cube indexed (channel, row, column).
///
/// # Arguments
///
/// * `data` - The cube.
/// * `spectral_axis` - One spectral coordinate per channel.
/// * `params` - Run configuration dict.
/// * `sink` - Optional object receiving artifacts through its `set_styles`, `save_model`,
///   `save_domain_map`, `plot_weights_map`, `plot_domain_map` and `plot_average_spectra` methods.
/// * `blank` - Optional no-data sentinel of the cube.
///
/// # Returns
///
/// * A dict with the save name, the model, the domain map and the fit diagnostics.
#[pyfunction]
#[pyo3(signature = (data, spectral_axis, params, sink=None, blank=None))]
pub fn full_run<'py>(
    py: Python<'py>,
    data: PyReadonlyArray3<'py, f64>,
    spectral_axis: PyReadonlyArray1<'py, f64>,
    params: &Bound<'py, PyDict>,
    sink: Option<Bound<'py, PyAny>>,
    blank: Option<f64>,
) -> PyResult<Bound<'py, PyDict>> {
    let params = params_from_dict(params)?;
    let cube = cube_from_arrays(data.as_array(), spectral_axis.as_array().to_owned(), blank)?;
    let mut sink = PySink::new(sink.filter(|s| !s.is_none()));
    let output = match RunOrchestrator::new().full_run(&cube, params, &mut sink) {
        Ok(output) => output,
        Err(err) => return Err(sink.into_py_err(err)),
    };

    let result = PyDict::new(py);
    result.set_item("save_name", &output.save_name)?;
    result.set_item("save_txt", output.params.save_txt.as_deref())?;
    result.set_item("model", PyMixtureModel::from(output.report.model.clone()))?;
    result.set_item("termination", termination_name(output.report.termination))?;
    result.set_item("iterations", output.report.iterations)?;
    result.set_item("log_likelihood", output.report.log_likelihood)?;
    result.set_item("reseeds", output.report.reseeds)?;
    result.set_item("domain_map", output.assignment.domain_map.to_pyarray(py))?;
    result.set_item("best_log_likelihood", output.assignment.log_likelihood.best.to_pyarray(py))?;
    result.set_item("components", output.assignment.components.clone())?;
    result.set_item("average_spectra", output.spectra.spectra.to_pyarray(py))?;
    Ok(result)
}

static LOGGER: Once = Once::new();

/// Routes the pipeline's log records to stderr.
///
/// `level` is an `env_logger` filter such as `"info"` or `"gmmis_components=debug"`. Later
/// calls have no effect.
#[pyfunction]
#[pyo3(signature = (level="info"))]
pub fn init_logging(level: &str) -> PyResult<()> {
    if level.trim().is_empty() {
        return Err(PyErr::new::<PyValueError, _>("log level must not be empty"));
    }
    LOGGER.call_once(|| {
        let initialized = env_logger::Builder::new().parse_filters(level).try_init();
        if initialized.is_ok() {
            log::info!("gmmis logging initialized at '{level}'");
        }
    });
    Ok(())
}
