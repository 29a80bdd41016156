//! Named reduction and normalization strategies.
//!
//! Each registry maps a selector name to a plain function. Adding a method means registering a
//! new entry. Only the identity strategy `"none"` is built in.
use std::collections::BTreeMap;
use std::fmt;

use itertools::Itertools;
use ndarray::prelude::*;

use super::{FeatureMatrix, SpatialShape};
use crate::{GmmError, Result};

/// Turns a (channel, row, column) cube and its validity mask into a feature matrix.
pub type ReduceFn = fn(ArrayView3<'_, f64>, ArrayView3<'_, bool>) -> Result<FeatureMatrix>;

/// Rescales the values of a feature matrix. The registry re-applies the input mask afterwards.
pub type NormalizeFn = fn(&FeatureMatrix) -> Result<Array2<f64>>;

pub const IDENTITY: &str = "none";

#[derive(Clone)]
pub struct ReductionRegistry {
    methods: BTreeMap<String, ReduceFn>,
}

impl Default for ReductionRegistry {
    fn default() -> Self {
        let mut registry = ReductionRegistry {
            methods: BTreeMap::new(),
        };
        registry.register(IDENTITY, flatten_cube);
        registry
    }
}

impl ReductionRegistry {
    pub fn register(&mut self, name: impl Into<String>, method: ReduceFn) {
        self.methods.insert(name.into(), method);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }

    /// Fails with `GmmError::UnsupportedMethod` unless `name` is registered.
    pub fn validate(&self, name: &str) -> Result<()> {
        lookup(&self.methods, "reduce_dimensions", "reduction", name).map(|_| ())
    }

    /// Applies the reduction registered as `name` to the cube data and mask.
    pub fn reduce(
        &self,
        name: &str,
        data: ArrayView3<'_, f64>,
        mask: ArrayView3<'_, bool>,
    ) -> Result<FeatureMatrix> {
        let method = lookup(&self.methods, "reduce_dimensions", "reduction", name)?;
        if data.dim() != mask.dim() {
            return Err(GmmError::shape(
                "reduce_dimensions",
                format!("cube is {:?} but mask is {:?}", data.dim(), mask.dim()),
            ));
        }
        method(data, mask)
    }
}

#[derive(Clone)]
pub struct NormalizationRegistry {
    methods: BTreeMap<String, NormalizeFn>,
}

impl Default for NormalizationRegistry {
    fn default() -> Self {
        let mut registry = NormalizationRegistry {
            methods: BTreeMap::new(),
        };
        registry.register(IDENTITY, identity);
        registry
    }
}

impl NormalizationRegistry {
    pub fn register(&mut self, name: impl Into<String>, method: NormalizeFn) {
        self.methods.insert(name.into(), method);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        lookup(&self.methods, "normalize", "normalization", name).map(|_| ())
    }

    /// Applies the normalization registered as `name`.
    ///
    /// Cells that were masked on input stay masked (and NaN) on output. A strategy that produces
    /// a non-finite value in a valid cell invalidates that cell as well.
    pub fn normalize(&self, name: &str, matrix: FeatureMatrix) -> Result<FeatureMatrix> {
        let method = lookup(&self.methods, "normalize", "normalization", name)?;
        let values = method(&matrix)?;
        matrix.replace_values(values)
    }
}

impl fmt::Debug for ReductionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.methods.keys()).finish()
    }
}

impl fmt::Debug for NormalizationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.methods.keys()).finish()
    }
}

fn lookup<F: Copy>(
    methods: &BTreeMap<String, F>,
    stage: &'static str,
    kind: &'static str,
    name: &str,
) -> Result<F> {
    methods
        .get(name)
        .copied()
        .ok_or_else(|| GmmError::UnsupportedMethod {
            stage,
            kind,
            name: name.to_string(),
            registered: methods.keys().join(", "),
        })
}

/// Reshapes the cube so that pixel `(row, col)` becomes row `row * cols + col` and channel `ch`
/// becomes feature `ch`.
pub fn flatten_cube(data: ArrayView3<'_, f64>, mask: ArrayView3<'_, bool>) -> Result<FeatureMatrix> {
    let (nchan, rows, cols) = data.dim();
    let shape = SpatialShape::new(rows, cols);
    let values = Array2::from_shape_fn((shape.len(), nchan), |(i, ch)| {
        let (r, c) = shape.coords(i);
        data[[ch, r, c]]
    });
    let valid = Array2::from_shape_fn((shape.len(), nchan), |(i, ch)| {
        let (r, c) = shape.coords(i);
        mask[[ch, r, c]]
    });
    FeatureMatrix::new(values, valid, shape)
}

fn identity(matrix: &FeatureMatrix) -> Result<Array2<f64>> {
    Ok(matrix.values().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_and_mask() -> (Array3<f64>, Array3<bool>) {
        let data = Array3::from_shape_fn((3, 2, 4), |(ch, r, c)| (ch * 100 + r * 10 + c) as f64);
        let mut mask = Array3::from_elem((3, 2, 4), true);
        mask[[1, 1, 2]] = false;
        (data, mask)
    }

    #[test]
    fn test_identity_reduction_layout() {
        let (data, mask) = cube_and_mask();
        let fm = ReductionRegistry::default()
            .reduce("none", data.view(), mask.view())
            .unwrap();
        assert_eq!(fm.n_rows(), 8);
        assert_eq!(fm.n_features(), 3);
        let shape = fm.shape();
        for r in 0..2 {
            for c in 0..4 {
                let i = shape.flat_index(r, c);
                for ch in 0..3 {
                    if (ch, r, c) == (1, 1, 2) {
                        assert!(!fm.mask()[[i, ch]]);
                        assert!(fm.values()[[i, ch]].is_nan());
                    } else {
                        assert_eq!(fm.values()[[i, ch]], data[[ch, r, c]]);
                    }
                }
            }
        }
    }

    #[test]
    fn test_unknown_methods_are_rejected() {
        let (data, mask) = cube_and_mask();
        let err = ReductionRegistry::default()
            .reduce("pca", data.view(), mask.view())
            .unwrap_err();
        assert!(matches!(err, GmmError::UnsupportedMethod { .. }));

        let fm = flatten_cube(data.view(), mask.view()).unwrap();
        let err = NormalizationRegistry::default()
            .normalize("bogus", fm)
            .unwrap_err();
        match err {
            GmmError::UnsupportedMethod { name, registered, .. } => {
                assert_eq!(name, "bogus");
                assert_eq!(registered, "none");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_normalization_keeps_mask() {
        fn fill_zero(matrix: &FeatureMatrix) -> Result<Array2<f64>> {
            Ok(Array2::zeros(matrix.values().dim()))
        }
        let (data, mask) = cube_and_mask();
        let fm = flatten_cube(data.view(), mask.view()).unwrap();
        let before = fm.mask().to_owned();

        let mut registry = NormalizationRegistry::default();
        registry.register("zero", fill_zero);
        assert!(registry.contains("zero"));
        let normed = registry.normalize("zero", fm).unwrap();

        assert_eq!(normed.mask(), before.view());
        let i = normed.shape().flat_index(1, 2);
        assert!(normed.values()[[i, 1]].is_nan());
        assert_eq!(normed.values()[[0, 0]], 0.0);
    }

    #[test]
    fn test_registered_reduction_is_dispatched() {
        fn first_channel(data: ArrayView3<'_, f64>, mask: ArrayView3<'_, bool>) -> Result<FeatureMatrix> {
            flatten_cube(data.slice(s![0..1, .., ..]), mask.slice(s![0..1, .., ..]))
        }
        let (data, mask) = cube_and_mask();
        let mut registry = ReductionRegistry::default();
        registry.register("first", first_channel);
        assert_eq!(registry.names(), vec!["first", "none"]);
        let fm = registry.reduce("first", data.view(), mask.view()).unwrap();
        assert_eq!(fm.n_features(), 1);
    }
}
