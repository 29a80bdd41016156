use gmmis_components::cube::{chop_cube, Cube};
use gmmis_components::domain::{assign, responsibilities};
use gmmis_components::features::{FeatureMatrix, SpatialShape};
use gmmis_components::gmm::{fit, FitOptions, InitStrategy, Termination};
use gmmis_components::run::{save_check, ArtifactSink, NullSink, RunOrchestrator, RunParams, Scalar};
use gmmis_components::{GmmError, UNASSIGNED};
use ndarray::prelude::*;

/// Standard deviation of the offsets 0..10 about their mean.
const LATTICE_STD: f64 = 2.872_281_323_269_014_5;

/// 100 points around (0, 0) followed by 100 points around (10, 10), each a 10x10 lattice with
/// unit variance per feature, laid out as a 20x10 image.
fn separated_pair() -> Array2<f64> {
    Array2::from_shape_fn((200, 2), |(i, d)| {
        let local = i % 100;
        let offset = if d == 0 { local / 10 } else { local % 10 };
        let centre = if i < 100 { 0.0 } else { 10.0 };
        centre + (offset as f64 - 4.5) / LATTICE_STD
    })
}

fn sorted_by_first_feature(means: ArrayView2<'_, f64>) -> (usize, usize) {
    if means[[0, 0]] < means[[1, 0]] {
        (0, 1)
    } else {
        (1, 0)
    }
}

#[test]
fn test_two_separated_components_are_recovered() {
    let fm = FeatureMatrix::from_values(separated_pair(), SpatialShape::new(20, 10)).unwrap();
    let report = fit(&fm, &FitOptions::new(2).with_init(InitStrategy::SpatialGrid)).unwrap();
    assert_eq!(report.termination, Termination::Converged);

    let model = &report.model;
    let (lo, hi) = sorted_by_first_feature(model.means());
    for k in 0..2 {
        assert!((model.weights()[k] - 0.5).abs() < 0.05);
    }
    for d in 0..2 {
        assert!(model.means()[[lo, d]].abs() < 0.5);
        assert!((model.means()[[hi, d]] - 10.0).abs() < 0.5);
    }

    let assignment = assign(model, &fm, 0.5).unwrap();
    assert!(assignment.domain_map.slice(s![..10, ..]).iter().all(|&l| l == lo as i64));
    assert!(assignment.domain_map.slice(s![10.., ..]).iter().all(|&l| l == hi as i64));
}

#[test]
fn test_inverted_range_is_rejected() {
    let cube = Cube::new(Array3::zeros((5, 2, 2)), array![-10.0, -5.0, 0.0, 5.0, 10.0]).unwrap();
    match chop_cube(5.0, -5.0, &cube).unwrap_err() {
        GmmError::Range { min, max, .. } => {
            assert_eq!(min, 5.0);
            assert_eq!(max, -5.0);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_unknown_normalization_fails_before_fitting() {
    struct Untouchable;
    impl ArtifactSink for Untouchable {
        fn set_styles(&mut self) -> gmmis_components::Result<()> {
            panic!("no artifact hook may run");
        }
    }

    let cube = Cube::new(Array3::from_elem((3, 2, 2), 1.0), array![-1.0, 0.0, 1.0]).unwrap();
    let params = RunParams {
        source_name: Some("src".to_string()),
        vel_min: Some(Scalar::Int(-1)),
        vel_max: Some(Scalar::Int(1)),
        // far more components than pixels: fitting would fail with a configuration error
        num_clusters: Some(50),
        norm_method: Some("bogus".to_string()),
        reduce_method: Some("none".to_string()),
        save_txt: Some("run".to_string()),
        ..RunParams::default()
    };
    let err = RunOrchestrator::new()
        .full_run(&cube, params, &mut Untouchable)
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
fn test_fully_masked_row_is_ignored_and_unassigned() {
    let values = separated_pair();
    let full = FeatureMatrix::from_values(values.clone(), SpatialShape::new(20, 10))
        .unwrap()
        .with_masked_cells([(0, 0), (0, 1)]);
    let without = FeatureMatrix::from_values(values.slice(s![1.., ..]).to_owned(), SpatialShape::new(1, 199)).unwrap();

    let options = FitOptions::new(2).with_init(InitStrategy::Means(array![[1.0, 1.0], [9.0, 9.0]]));
    let with_masked = fit(&full, &options).unwrap();
    let reference = fit(&without, &options).unwrap();
    assert_eq!(with_masked.iterations, reference.iterations);
    for (a, b) in with_masked
        .model
        .means()
        .iter()
        .zip(reference.model.means().iter())
    {
        assert!((a - b).abs() < 1e-9);
    }
    for (a, b) in with_masked
        .model
        .covariances()
        .iter()
        .zip(reference.model.covariances().iter())
    {
        assert!((a - b).abs() < 1e-9);
    }

    let assignment = assign(&with_masked.model, &full, 0.0).unwrap();
    assert_eq!(assignment.domain_map[[0, 0]], UNASSIGNED);
    assert_eq!(assignment.log_likelihood.best[[0, 0]], f64::NEG_INFINITY);
    assert!(assignment.domain_map.iter().skip(1).all(|&l| l != UNASSIGNED));
}

#[test]
fn test_save_name_is_derived() {
    let params = RunParams {
        save_txt: Some("none".to_string()),
        num_clusters: Some(3),
        norm_method: Some("none".to_string()),
        rms_threshold: Some(Scalar::Float(2.0)),
        vel_min: Some(Scalar::Int(-5)),
        vel_max: Some(Scalar::Int(5)),
        ..RunParams::default()
    };
    let checked = save_check(params).unwrap();
    assert_eq!(checked.save_txt.as_deref(), Some("N3_none_2.0rms_-5-5"));
}

#[test]
fn test_responsibilities_sum_to_one() {
    let fm = FeatureMatrix::from_values(separated_pair(), SpatialShape::new(20, 10))
        .unwrap()
        .with_masked_cells([(3, 1), (150, 0)]);
    let report = fit(&fm, &FitOptions::new(3).with_seed(5)).unwrap();
    let resp = responsibilities(&report.model, &fm).unwrap();
    for i in 0..fm.n_rows() {
        assert!((resp.component.row(i).sum() - 1.0).abs() < 1e-9);
    }
}

#[test]
fn test_pipeline_on_contaminated_cube() {
    const BLANK: f64 = -999.0;
    // 5 channels over 8x6, top rows peak at +2 km/s, bottom rows at -2 km/s
    let axis = array![-4.0, -2.0, 0.0, 2.0, 4.0];
    let mut data = Array3::from_shape_fn((5, 8, 6), |(ch, r, c)| {
        let peak = if r < 4 { 3 } else { 1 };
        let line = if ch == peak { 8.0 } else { 0.0 };
        line + ((r * 53 + c * 29 + ch * 11) % 19) as f64 / 19.0
    });
    data.slice_mut(s![.., 7, 5]).fill(BLANK);
    data[[2, 0, 0]] = f64::NAN;
    data[[4, 3, 2]] = f64::INFINITY;
    let cube = Cube::new(data, axis).unwrap().with_blank(BLANK);

    let params = RunParams {
        source_name: Some("cube".to_string()),
        vel_min: Some(Scalar::Float(-2.0)),
        vel_max: Some(Scalar::Float(4.0)),
        num_clusters: Some(2),
        norm_method: Some("none".to_string()),
        reduce_method: Some("none".to_string()),
        rms_threshold: Some(Scalar::Int(3)),
        save_txt: Some("none".to_string()),
        init: Some("grid".to_string()),
        threads: Some(2),
        ..RunParams::default()
    };
    let output = RunOrchestrator::new()
        .full_run(&cube, params, &mut NullSink)
        .unwrap();

    assert_eq!(output.save_name, "cube_N2_none_3rms_-2.0-4.0");
    assert_eq!(output.cube.n_channels(), 4);
    let map = &output.assignment.domain_map;
    assert_eq!(map.dim(), (8, 6));
    assert_eq!(map[[7, 5]], UNASSIGNED);
    assert_ne!(map[[0, 0]], map[[7, 0]]);
    for ((r, c), &label) in map.indexed_iter() {
        if (r, c) == (7, 5) {
            continue;
        }
        let expected = if r < 4 { map[[0, 0]] } else { map[[7, 0]] };
        assert_eq!(label, expected, "pixel ({r}, {c})");
    }
    assert_eq!(output.spectra.spectra.dim(), (2, 4));
    assert!((output.spectra.fractions.sum() - 1.0).abs() < 1e-12);
}

#[test]
fn test_runs_are_reproducible() {
    let fm = FeatureMatrix::from_values(separated_pair(), SpatialShape::new(20, 10)).unwrap();
    let options = FitOptions::new(2).with_seed(42);
    let a = fit(&fm, &options.clone().with_threads(Some(3))).unwrap();
    let b = fit(&fm, &options).unwrap();
    assert_eq!(a.model, b.model);
    assert_eq!(
        assign(&a.model, &fm, 0.5).unwrap(),
        assign(&b.model, &fm, 0.5).unwrap()
    );
}
