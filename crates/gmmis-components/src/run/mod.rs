//! End-to-end pipeline: configuration, save naming, stage ordering and artifact hooks.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cube::{chop_cube, Cube};
use crate::domain::{assign_with_threads, average_spectra, domain_fractions, DomainAssignment};
use crate::features::{
    apply_rms_filter, mask_invalid, FeatureMatrix, NormalizationRegistry, NormalizeFn, ReduceFn,
    ReductionRegistry,
};
use crate::gmm::{fit_with_cancel, FitOptions, FitReport, InitStrategy, MixtureModel};
use crate::{GmmError, Result};

/// Domain assignment threshold used when the run does not set one. Every valid pixel goes to its
/// most probable component.
pub const DEFAULT_ASSIGNMENT_THRESHOLD: f64 = 0.0;

/// A configuration number that remembers whether it was written as an integer or a float.
///
/// Save names embed these values, so `2` and `2.0` must print differently.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Int(v) => v as f64,
            Scalar::Float(v) => v,
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => f.write_str(&float_repr(v)),
        }
    }
}

/// Shortest round-trip float text with a trailing `.0` on integral values and a two-digit
/// exponent outside `[1e-4, 1e16)`.
fn float_repr(v: f64) -> String {
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let magnitude = v.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let text = format!("{v:e}");
        return match text.split_once('e') {
            Some((mantissa, exponent)) => {
                let (sign, digits) = match exponent.strip_prefix('-') {
                    Some(digits) => ('-', digits),
                    None => ('+', exponent),
                };
                format!("{mantissa}e{sign}{digits:0>2}")
            }
            None => text,
        };
    }
    if v.fract() == 0.0 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

/// Settings of one pipeline run.
///
/// Every field is optional. Absent flags count as `false`. Absent required values are reported
/// as `GmmError::Configuration` by the stage that first needs them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunParams {
    pub source_name: Option<String>,
    pub vel_min: Option<Scalar>,
    pub vel_max: Option<Scalar>,
    pub num_clusters: Option<usize>,
    pub norm_method: Option<String>,
    pub reduce_method: Option<String>,
    pub rms_threshold: Option<Scalar>,
    /// Save-name suffix. `"none"` asks [`save_check`] to derive one.
    pub save_txt: Option<String>,
    pub save_gmm: Option<bool>,
    pub save_dmap: Option<bool>,
    pub save_figs: Option<bool>,
    pub apply_rms_filter: Option<bool>,
    pub seed: Option<u64>,
    /// `"random"` or `"grid"`.
    pub init: Option<String>,
    pub background: Option<bool>,
    pub tolerance: Option<f64>,
    pub max_iterations: Option<usize>,
    pub assignment_threshold: Option<f64>,
    pub threads: Option<usize>,
}

fn require<T>(value: Option<T>, stage: &'static str, field: &'static str) -> Result<T> {
    value.ok_or_else(|| GmmError::missing(stage, field))
}

impl RunParams {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn source_name(&self, stage: &'static str) -> Result<&str> {
        require(self.source_name.as_deref(), stage, "source_name")
    }

    pub fn save_txt(&self, stage: &'static str) -> Result<&str> {
        require(self.save_txt.as_deref(), stage, "save_txt")
    }

    pub fn num_clusters(&self, stage: &'static str) -> Result<usize> {
        require(self.num_clusters, stage, "num_clusters")
    }

    pub fn norm_method(&self, stage: &'static str) -> Result<&str> {
        require(self.norm_method.as_deref(), stage, "norm_method")
    }

    pub fn reduce_method(&self, stage: &'static str) -> Result<&str> {
        require(self.reduce_method.as_deref(), stage, "reduce_method")
    }

    pub fn rms_threshold(&self, stage: &'static str) -> Result<Scalar> {
        require(self.rms_threshold, stage, "rms_threshold")
    }

    /// `(vel_min, vel_max)` as written in the configuration.
    pub fn velocity_range(&self, stage: &'static str) -> Result<(Scalar, Scalar)> {
        Ok((
            require(self.vel_min, stage, "vel_min")?,
            require(self.vel_max, stage, "vel_max")?,
        ))
    }

    pub fn save_gmm(&self) -> bool {
        self.save_gmm.unwrap_or(false)
    }

    pub fn save_dmap(&self) -> bool {
        self.save_dmap.unwrap_or(false)
    }

    pub fn save_figs(&self) -> bool {
        self.save_figs.unwrap_or(false)
    }

    pub fn rms_filter_enabled(&self) -> bool {
        self.apply_rms_filter.unwrap_or(false)
    }

    /// `{source_name}_{save_txt}`, the prefix every artifact of the run is saved under.
    pub fn save_prefix(&self, stage: &'static str) -> Result<String> {
        Ok(format!("{}_{}", self.source_name(stage)?, self.save_txt(stage)?))
    }

    /// Fit hyperparameters. Tuning fields that are absent keep the [`FitOptions`] defaults.
    pub fn fit_options(&self, stage: &'static str) -> Result<FitOptions> {
        let mut options = FitOptions::new(self.num_clusters(stage)?)
            .with_background(self.background.unwrap_or(false))
            .with_threads(self.threads);
        if let Some(seed) = self.seed {
            options = options.with_seed(seed);
        }
        if let Some(name) = &self.init {
            options = options.with_init(InitStrategy::from_name(name)?);
        }
        if let Some(tolerance) = self.tolerance {
            options = options.with_tolerance(tolerance);
        }
        if let Some(max_iterations) = self.max_iterations {
            options = options.with_max_iterations(max_iterations);
        }
        Ok(options)
    }
}

/// Derives the save-name suffix `N{K}_{norm}_{rms}rms_{vmin}-{vmax}`.
///
/// # Errors
///
/// * `GmmError::Configuration` naming the first field the name needs but the params lack.
pub fn derive_save_name(params: &RunParams) -> Result<String> {
    const STAGE: &str = "save_check";
    let k = params.num_clusters(STAGE)?;
    let norm = params.norm_method(STAGE)?;
    let rms = params.rms_threshold(STAGE)?;
    let (vmin, vmax) = params.velocity_range(STAGE)?;
    Ok(format!("N{k}_{norm}_{rms}rms_{vmin}-{vmax}"))
}

/// Resolves the save name of a run.
///
/// If `save_txt` is `"none"` it is replaced by [`derive_save_name`]. Any other value is kept.
///
/// # Returns
///
/// * The params with `save_txt` filled in.
///
/// # Errors
///
/// * `GmmError::Configuration` if `save_txt` is absent or the derived name lacks a field.
pub fn save_check(mut params: RunParams) -> Result<RunParams> {
    const STAGE: &str = "save_check";
    if params.save_txt(STAGE)? == "none" {
        params.save_txt = Some(derive_save_name(&params)?);
    }
    let save_txt = params.save_txt(STAGE)?;
    match params.source_name.as_deref() {
        Some(source) => log::info!("save_check: files saved under {source}_{save_txt}"),
        None => log::info!("save_check: files saved under suffix {save_txt}"),
    }
    log::info!(
        "save_check: save_gmm={} save_dmap={} save_figs={}",
        params.save_gmm(),
        params.save_dmap(),
        params.save_figs()
    );
    Ok(params)
}

/// Averaged spectra of every domain, for the spectra figure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpectraSummary {
    /// Spectral coordinate of every feature of the chopped cube.
    pub spectral_axis: Array1<f64>,
    /// K x M mean spectrum per component, from the un-normalized features.
    pub spectra: Array2<f64>,
    /// Fraction of the assigned pixels in each domain.
    pub fractions: Array1<f64>,
}

/// Receives the artifacts and figures of a run.
///
/// Every hook defaults to doing nothing, so an implementation only overrides what it writes.
pub trait ArtifactSink {
    /// Prepares plot styling. Called at most once per orchestrator.
    fn set_styles(&mut self) -> Result<()> {
        Ok(())
    }

    fn save_model(&mut self, _name: &str, _model: &MixtureModel) -> Result<()> {
        Ok(())
    }

    fn save_domain_map(&mut self, _name: &str, _assignment: &DomainAssignment) -> Result<()> {
        Ok(())
    }

    fn plot_weights_map(
        &mut self,
        _name: &str,
        _model: &MixtureModel,
        _assignment: &DomainAssignment,
    ) -> Result<()> {
        Ok(())
    }

    fn plot_domain_map(&mut self, _name: &str, _cube: &Cube, _assignment: &DomainAssignment) -> Result<()> {
        Ok(())
    }

    fn plot_average_spectra(&mut self, _name: &str, _summary: &SpectraSummary) -> Result<()> {
        Ok(())
    }
}

/// Sink that keeps nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl ArtifactSink for NullSink {}

/// Everything a run produced.
#[derive(Clone, Debug)]
pub struct RunOutput {
    /// The params after [`save_check`].
    pub params: RunParams,
    /// `{source_name}_{save_txt}`.
    pub save_name: String,
    /// The chopped cube the features came from.
    pub cube: Cube,
    /// Reduced features before normalization.
    pub reduced: FeatureMatrix,
    pub report: FitReport,
    pub assignment: DomainAssignment,
    pub spectra: SpectraSummary,
}

/// Runs the full pipeline with a fixed set of reduction and normalization strategies.
#[derive(Clone, Debug, Default)]
pub struct RunOrchestrator {
    reductions: ReductionRegistry,
    normalizations: NormalizationRegistry,
    styles_ready: bool,
}

impl RunOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reduction(mut self, name: impl Into<String>, method: ReduceFn) -> Self {
        self.reductions.register(name, method);
        self
    }

    pub fn with_normalization(mut self, name: impl Into<String>, method: NormalizeFn) -> Self {
        self.normalizations.register(name, method);
        self
    }

    pub fn reductions(&self) -> &ReductionRegistry {
        &self.reductions
    }

    pub fn normalizations(&self) -> &NormalizationRegistry {
        &self.normalizations
    }

    /// Runs every stage on `cube` and hands the artifacts the params ask for to `sink`.
    ///
    /// See [`RunOrchestrator::full_run_with_cancel`].
    pub fn full_run(&mut self, cube: &Cube, params: RunParams, sink: &mut dyn ArtifactSink) -> Result<RunOutput> {
        self.full_run_with_cancel(cube, params, sink, &AtomicBool::new(false))
    }

    /// Runs the pipeline: save check, chop, mask, optional rms filter, reduce, normalize, fit,
    /// assign, then the sink hooks.
    ///
    /// Method names and fit settings are checked before any data is touched. `save_model` runs
    /// when `save_gmm` is set, `save_domain_map` when `save_dmap` is set and the three plot hooks
    /// when `save_figs` is set. A cancelled fit skips every hook.
    ///
    /// # Arguments
    ///
    /// * `cube` - The full cube. It is not modified.
    /// * `params` - Run configuration.
    /// * `sink` - Artifact receiver.
    /// * `cancel` - Raised to stop the fit early.
    ///
    /// # Errors
    ///
    /// * `GmmError::Configuration` for a missing or invalid required field.
    /// * `GmmError::UnsupportedMethod` for an unknown reduction, normalization or initialization.
    /// * Any error of the individual stages or of the sink.
    pub fn full_run_with_cancel(
        &mut self,
        cube: &Cube,
        params: RunParams,
        sink: &mut dyn ArtifactSink,
        cancel: &AtomicBool,
    ) -> Result<RunOutput> {
        const STAGE: &str = "full_run";
        let params = save_check(params)?;
        let save_name = params.save_prefix(STAGE)?;
        log::info!("full_run: starting {save_name}");

        let (vel_min, vel_max) = params.velocity_range(STAGE)?;
        let reduce_method = params.reduce_method(STAGE)?;
        let norm_method = params.norm_method(STAGE)?;
        self.reductions.validate(reduce_method)?;
        self.normalizations.validate(norm_method)?;
        let options = params.fit_options(STAGE)?;
        let threshold = params
            .assignment_threshold
            .unwrap_or(DEFAULT_ASSIGNMENT_THRESHOLD);
        let rms_threshold = if params.rms_filter_enabled() {
            Some(params.rms_threshold(STAGE)?.as_f64())
        } else {
            None
        };

        let chopped = chop_cube(vel_min.as_f64(), vel_max.as_f64(), cube)?;
        let mut mask = mask_invalid(&chopped);
        if let Some(rms) = rms_threshold {
            mask = apply_rms_filter(&chopped, &mask, rms)?;
        }
        let reduced = self
            .reductions
            .reduce(reduce_method, chopped.data(), mask.view())?;
        let features = self.normalizations.normalize(norm_method, reduced.clone())?;
        log::info!(
            "full_run: {} spatial points, {} with data, {} features",
            features.n_rows(),
            features.n_valid_rows(),
            features.n_features()
        );

        let report = fit_with_cancel(&features, &options, cancel)?;
        let assignment = assign_with_threads(&report.model, &features, threshold, options.threads)?;
        let k = report.model.n_components();
        let spectra = SpectraSummary {
            spectral_axis: chopped.spectral_axis().to_owned(),
            spectra: average_spectra(assignment.domain_map.view(), &reduced, k)?,
            fractions: domain_fractions(assignment.domain_map.view(), k),
        };

        if !report.is_complete() || cancel.load(Ordering::Relaxed) {
            log::warn!("full_run: {save_name} was cancelled, no artifacts written");
        } else {
            self.ensure_styles(sink)?;
            if params.save_gmm() {
                sink.save_model(&save_name, &report.model)?;
            }
            if params.save_dmap() {
                sink.save_domain_map(&save_name, &assignment)?;
            }
            if params.save_figs() {
                sink.plot_weights_map(&save_name, &report.model, &assignment)?;
                sink.plot_domain_map(&save_name, &chopped, &assignment)?;
                sink.plot_average_spectra(&save_name, &spectra)?;
            }
        }
        log::info!(
            "full_run: {save_name} finished, {} of {k} components used",
            assignment.components.len()
        );

        Ok(RunOutput {
            params,
            save_name,
            cube: chopped,
            reduced,
            report,
            assignment,
            spectra,
        })
    }

    fn ensure_styles(&mut self, sink: &mut dyn ArtifactSink) -> Result<()> {
        if !self.styles_ready {
            sink.set_styles()?;
            self.styles_ready = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UNASSIGNED;

    fn scenario_e() -> RunParams {
        RunParams::from_json_str(
            r#"{"save_txt": "none", "num_clusters": 3, "norm_method": "none",
                "rms_threshold": 2.0, "vel_min": -5, "vel_max": 5}"#,
        )
        .unwrap()
    }

    /// 4 channels over a 6x8 image. The top half peaks in channel 1, the bottom half in
    /// channel 2.
    fn two_domain_cube() -> Cube {
        let data = Array3::from_shape_fn((4, 6, 8), |(ch, r, c)| {
            let peak = if r < 3 { 1 } else { 2 };
            let line = if ch == peak { 10.0 } else { 0.0 };
            line + ((r * 131 + c * 71 + ch * 37) % 23) as f64 / 23.0
        });
        Cube::new(data, array![-3.0, -1.0, 1.0, 3.0]).unwrap()
    }

    fn run_params() -> RunParams {
        RunParams {
            source_name: Some("G0".to_string()),
            vel_min: Some(Scalar::Int(-5)),
            vel_max: Some(Scalar::Int(5)),
            num_clusters: Some(2),
            norm_method: Some("none".to_string()),
            reduce_method: Some("none".to_string()),
            rms_threshold: Some(Scalar::Float(2.0)),
            save_txt: Some("test".to_string()),
            init: Some("grid".to_string()),
            ..RunParams::default()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Vec<String>,
    }

    impl ArtifactSink for RecordingSink {
        fn set_styles(&mut self) -> Result<()> {
            self.calls.push("set_styles".to_string());
            Ok(())
        }

        fn save_model(&mut self, name: &str, _model: &MixtureModel) -> Result<()> {
            self.calls.push(format!("save_model:{name}"));
            Ok(())
        }

        fn save_domain_map(&mut self, name: &str, _assignment: &DomainAssignment) -> Result<()> {
            self.calls.push(format!("save_domain_map:{name}"));
            Ok(())
        }

        fn plot_weights_map(&mut self, _: &str, _: &MixtureModel, _: &DomainAssignment) -> Result<()> {
            self.calls.push("plot_weights_map".to_string());
            Ok(())
        }

        fn plot_domain_map(&mut self, _: &str, _: &Cube, _: &DomainAssignment) -> Result<()> {
            self.calls.push("plot_domain_map".to_string());
            Ok(())
        }

        fn plot_average_spectra(&mut self, _: &str, summary: &SpectraSummary) -> Result<()> {
            self.calls.push(format!("plot_average_spectra:{}", summary.spectra.nrows()));
            Ok(())
        }
    }

    #[test]
    fn test_scalar_display_keeps_written_type() {
        assert_eq!(Scalar::Int(-5).to_string(), "-5");
        assert_eq!(Scalar::Float(2.0).to_string(), "2.0");
        assert_eq!(Scalar::Float(-0.5).to_string(), "-0.5");
        assert_eq!(Scalar::Float(1e-5).to_string(), "1e-05");
        assert_eq!(Scalar::Float(1e16).to_string(), "1e+16");
        assert_eq!(Scalar::Float(f64::NAN).to_string(), "nan");
    }

    #[test]
    fn test_scalar_deserializes_int_and_float() {
        let values: Vec<Scalar> = serde_json::from_str("[3, 3.0, -2]").unwrap();
        assert_eq!(values, vec![Scalar::Int(3), Scalar::Float(3.0), Scalar::Int(-2)]);
    }

    #[test]
    fn test_save_check_derives_name() {
        let params = save_check(scenario_e()).unwrap();
        assert_eq!(params.save_txt.as_deref(), Some("N3_none_2.0rms_-5-5"));
    }

    #[test]
    fn test_save_check_keeps_explicit_name() {
        let mut params = scenario_e();
        params.save_txt = Some("custom".to_string());
        params.num_clusters = None;
        assert_eq!(save_check(params).unwrap().save_txt.as_deref(), Some("custom"));
    }

    #[test]
    fn test_save_check_names_missing_field() {
        let mut params = scenario_e();
        params.rms_threshold = None;
        match save_check(params).unwrap_err() {
            GmmError::Configuration { stage, field, .. } => {
                assert_eq!(stage, "save_check");
                assert_eq!(field, "rms_threshold");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(
            save_check(RunParams::default()),
            Err(GmmError::Configuration { field: "save_txt", .. })
        ));
    }

    #[test]
    fn test_absent_flags_are_false() {
        let params = RunParams::from_json_str("{}").unwrap();
        assert!(!params.save_gmm());
        assert!(!params.save_dmap());
        assert!(!params.save_figs());
        assert!(!params.rms_filter_enabled());
    }

    #[test]
    fn test_full_run_calls_gated_hooks() {
        let mut params = run_params();
        params.save_gmm = Some(true);
        params.save_figs = Some(true);
        let mut sink = RecordingSink::default();
        let output = RunOrchestrator::new()
            .full_run(&two_domain_cube(), params, &mut sink)
            .unwrap();

        assert_eq!(output.save_name, "G0_test");
        assert_eq!(
            sink.calls,
            vec![
                "set_styles",
                "save_model:G0_test",
                "plot_weights_map",
                "plot_domain_map",
                "plot_average_spectra:2",
            ]
        );
        let map = &output.assignment.domain_map;
        assert_eq!(map.dim(), (6, 8));
        assert!(map.iter().all(|&label| label != UNASSIGNED));
        assert_ne!(map[[0, 0]], map[[5, 0]]);
        for r in 0..6 {
            for c in 0..8 {
                let expected = if r < 3 { map[[0, 0]] } else { map[[5, 0]] };
                assert_eq!(map[[r, c]], expected);
            }
        }
        assert_eq!(output.assignment.components, vec![0, 1]);
    }

    #[test]
    fn test_styles_are_set_once_per_orchestrator() {
        let mut orchestrator = RunOrchestrator::new();
        let mut sink = RecordingSink::default();
        for _ in 0..2 {
            orchestrator
                .full_run(&two_domain_cube(), run_params(), &mut sink)
                .unwrap();
        }
        assert_eq!(sink.calls, vec!["set_styles"]);
    }

    #[test]
    fn test_unknown_method_fails_before_any_hook() {
        let mut params = run_params();
        params.norm_method = Some("zscore".to_string());
        params.save_gmm = Some(true);
        let mut sink = RecordingSink::default();
        let err = RunOrchestrator::new()
            .full_run(&two_domain_cube(), params, &mut sink)
            .unwrap_err();
        assert!(matches!(err, GmmError::UnsupportedMethod { stage: "normalize", .. }));
        assert!(sink.calls.is_empty());
    }

    #[test]
    fn test_registered_normalization_is_used() {
        fn doubled(matrix: &FeatureMatrix) -> Result<Array2<f64>> {
            Ok(matrix.values().mapv(|v| 2.0 * v))
        }
        let mut params = run_params();
        params.norm_method = Some("double".to_string());
        let output = RunOrchestrator::new()
            .with_normalization("double", doubled)
            .full_run(&two_domain_cube(), params, &mut NullSink)
            .unwrap();
        // the averaged spectra come from the features before normalization
        let peak = output
            .spectra
            .spectra
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        assert!(peak > 10.0 && peak < 11.0);
    }

    #[test]
    fn test_rms_filter_requires_threshold() {
        let mut params = run_params();
        params.apply_rms_filter = Some(true);
        params.rms_threshold = None;
        let err = RunOrchestrator::new()
            .full_run(&two_domain_cube(), params, &mut NullSink)
            .unwrap_err();
        assert!(matches!(err, GmmError::Configuration { field: "rms_threshold", .. }));
    }

    #[test]
    fn test_cancelled_run_writes_nothing() {
        let mut params = run_params();
        params.save_gmm = Some(true);
        params.save_dmap = Some(true);
        let mut sink = RecordingSink::default();
        let output = RunOrchestrator::new()
            .full_run_with_cancel(&two_domain_cube(), params, &mut sink, &AtomicBool::new(true))
            .unwrap();
        assert!(!output.report.is_complete());
        assert!(sink.calls.is_empty());
    }
}
