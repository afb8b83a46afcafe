//! Logging helper for `Result`.
//!
//! `log` records the error with the caller's source location before it is
//! propagated with `?`, so failures deep inside a run still show up in the
//! run's trace even when the caller only reports the top-level error.

use std::fmt::Display;
use tracing::error;

/// Adds `log` to `Result`.
pub trait ResultExt<T, E> {
    /// Log the error with `context` if this is an `Err`, returning `self` unchanged.
    ///
    /// ```ignore
    /// use fabric_dbt_runner::result_ext::ResultExt;
    ///
    /// let profile = resolver.resolve(&env, &keys).await.log("resolving profile")?;
    /// ```
    fn log<S: ToString>(self, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let caller_location = std::panic::Location::caller();
            error!(
                target: "fabric_dbt_runner",
                error = %e,
                file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                context = %context.to_string(),
                "Operation failed"
            );
        }
        self
    }
}
