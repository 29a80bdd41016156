//! Missing-data-aware Gaussian mixture fitting for spectral-line cubes.
//!
//! ```text
//!   Cube ──chop──▶ Cube ──mask/reduce/normalize──▶ FeatureMatrix
//!                                                      │
//!                                  gmm::fit ◀──────────┤
//!                                     │                │
//!                                MixtureModel ──▶ domain::assign ──▶ DomainAssignment
//! ```
pub mod cube;
pub mod domain;
pub mod error;
pub mod features;
pub mod gmm;
pub mod run;

pub use error::{GmmError, Result};

/// Sentinel stored in a domain map for pixels that belong to no component.
pub const UNASSIGNED: i64 = -1;

const VSMALL: f64 = 10.0 * std::f64::EPSILON;

/// Runs `op` on a dedicated pool of `threads` workers, or on the global rayon pool if `None`.
pub(crate) fn in_worker_pool<T, F>(threads: Option<usize>, op: F) -> Result<T>
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    match threads {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(n).build()?;
            Ok(pool.install(op))
        }
        None => Ok(op()),
    }
}
