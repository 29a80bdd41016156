use thiserror::Error;

pub type Result<T> = std::result::Result<T, GmmError>;

#[derive(Debug, Error)]
pub enum GmmError {
    /// Spectral bounds are inverted, not finite, or miss the cube entirely.
    #[error("{stage}: invalid spectral range [{min}, {max}]: {reason}")]
    Range {
        stage: &'static str,
        min: f64,
        max: f64,
        reason: String,
    },

    #[error("{stage}: unsupported {kind} method '{name}' (registered: {registered})")]
    UnsupportedMethod {
        stage: &'static str,
        kind: &'static str,
        name: String,
        registered: String,
    },

    /// Recoverable collapse of a single component. The fitter re-seeds on this.
    #[error("component {component} degenerate at iteration {iteration}: {reason}")]
    DegenerateFit {
        component: usize,
        iteration: usize,
        reason: String,
    },

    #[error("fit diverged after {iterations} iterations and {reseeds} re-seeds (last log-likelihood {log_likelihood})")]
    FitDiverged {
        iterations: usize,
        reseeds: usize,
        log_likelihood: f64,
    },

    #[error("{stage}: required parameter '{field}' {reason}")]
    Configuration {
        stage: &'static str,
        field: &'static str,
        reason: String,
    },

    #[error("{stage}: shape mismatch: {reason}")]
    Shape { stage: &'static str, reason: String },

    /// Failure reported by an external artifact or plotting collaborator.
    #[error("collaborator '{hook}' failed: {reason}")]
    Collaborator { hook: &'static str, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl GmmError {
    pub(crate) fn missing(stage: &'static str, field: &'static str) -> Self {
        GmmError::Configuration {
            stage,
            field,
            reason: "was not supplied".to_string(),
        }
    }

    pub(crate) fn shape(stage: &'static str, reason: impl Into<String>) -> Self {
        GmmError::Shape {
            stage,
            reason: reason.into(),
        }
    }
}
