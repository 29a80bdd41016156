//! Python extension for the gmmis spectral-cube mixture pipeline.
//!
//! The algorithms live in `gmmis-components`. This crate only converts between NumPy arrays and
//! the pipeline types and maps pipeline errors onto Python exceptions.
pub use gmmis_components as components;

#[cfg(feature = "python")]
pub mod cube_functions;
#[cfg(feature = "python")]
pub mod errors;
#[cfg(feature = "python")]
pub mod fit_functions;
#[cfg(feature = "python")]
pub mod run_functions;

#[cfg(all(feature = "python", not(target_env = "msvc")))]
use tikv_jemallocator::Jemalloc;

#[cfg(all(feature = "python", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
#[pyo3(name = "_gmmis")]
mod gmmis {
    use super::*;

    #[pymodule_export]
    use crate::fit_functions::PyMixtureModel;

    #[pymodule_export]
    use crate::run_functions::{full_run, init_logging, save_check};

    #[pymodule_init]
    fn init(m: &Bound<'_, PyModule>) -> PyResult<()> {
        crate::errors::add_exceptions(m)
    }

    #[pymodule]
    mod cube_functions {
        #[pymodule_export]
        use crate::cube_functions::{apply_rms_filter, chop_cube, mask_invalid};
    }

    #[pymodule]
    mod fit_functions {
        #[pymodule_export]
        use crate::fit_functions::{fit_model, make_domain_map};
    }
}

#[cfg(test)]
mod tests {
    use crate::components::features::SpatialShape;

    #[test]
    fn test_components_are_usable_without_python() {
        let shape = SpatialShape::new(2, 3);
        assert_eq!(shape.len(), 6);
        assert_eq!(shape.coords(shape.flat_index(1, 2)), (1, 2));
    }
}
