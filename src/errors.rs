use gmmis_components::GmmError;
use pyo3::create_exception;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

create_exception!(_gmmis, RangeError, PyValueError, "Spectral bounds are inverted, not finite, or select no channel.");
create_exception!(_gmmis, UnsupportedMethodError, PyValueError, "A reduction, normalization or initialization name is not registered.");
create_exception!(_gmmis, DegenerateFitError, PyValueError, "A mixture component collapsed.");
create_exception!(_gmmis, FitDivergedError, PyValueError, "The fit exhausted its re-seed budget.");
create_exception!(_gmmis, ConfigurationError, PyValueError, "A required run parameter is missing or invalid.");

/// Converts a pipeline error into the matching Python exception.
pub fn to_py_err(err: GmmError) -> PyErr {
    let msg = err.to_string();
    match err {
        GmmError::Range { .. } => RangeError::new_err(msg),
        GmmError::UnsupportedMethod { .. } => UnsupportedMethodError::new_err(msg),
        GmmError::DegenerateFit { .. } => DegenerateFitError::new_err(msg),
        GmmError::FitDiverged { .. } => FitDivergedError::new_err(msg),
        GmmError::Configuration { .. } => ConfigurationError::new_err(msg),
        GmmError::Shape { .. } | GmmError::Serialization(_) => PyErr::new::<PyValueError, _>(msg),
        GmmError::Collaborator { .. } | GmmError::ThreadPool(_) => PyErr::new::<PyRuntimeError, _>(msg),
    }
}

/// Registers the exception classes on the extension module.
pub fn add_exceptions(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let py = m.py();
    m.add("RangeError", py.get_type::<RangeError>())?;
    m.add("UnsupportedMethodError", py.get_type::<UnsupportedMethodError>())?;
    m.add("DegenerateFitError", py.get_type::<DegenerateFitError>())?;
    m.add("FitDivergedError", py.get_type::<FitDivergedError>())?;
    m.add("ConfigurationError", py.get_type::<ConfigurationError>())?;
    Ok(())
}
