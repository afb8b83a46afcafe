//! Error type surfaced by the orchestrator.

use thiserror::Error;
use uuid::Uuid;

use crate::executor::ExecutionError;
use crate::plan::PlanConsistencyError;
use crate::records::RunSummary;
use crate::selector::SelectionSyntaxError;
use crate::store::StoreError;
use crate::variables::ConfigurationError;

/// Errors that prevented a run from producing a normal summary.
#[derive(Debug, Error)]
pub enum RunError {
    /// Bad or missing configuration; nothing was executed.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Selector text could not be compiled; nothing was executed.
    #[error(transparent)]
    SelectionSyntax(#[from] SelectionSyntaxError),

    /// Profile and plan disagree on the environment.
    #[error(transparent)]
    PlanConsistency(#[from] PlanConsistencyError),

    /// The engine aborted, or transient failures outlasted the retries.
    /// Records produced before the abort were persisted when possible.
    #[error("Execution aborted: {reason}")]
    ExecutionAborted {
        reason: String,
        /// Summary of what was persisted before the abort.
        summary: Option<Box<RunSummary>>,
    },

    /// The run id already belongs to a different plan.
    #[error("Run id {run_id} already belongs to a different plan")]
    DuplicateRunId { run_id: Uuid },

    /// Metadata store failure.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RunError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateRunId { run_id } => RunError::DuplicateRunId { run_id },
            other => RunError::Store(other),
        }
    }
}

impl From<ExecutionError> for RunError {
    fn from(e: ExecutionError) -> Self {
        RunError::ExecutionAborted {
            reason: e.reason(),
            summary: None,
        }
    }
}

impl RunError {
    /// Summary of the partial run, if one was persisted before the error.
    pub fn partial_summary(&self) -> Option<&RunSummary> {
        match self {
            RunError::ExecutionAborted { summary, .. } => summary.as_deref(),
            _ => None,
        }
    }

    /// True for errors raised before anything was executed or stored.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RunError::Configuration(_) | RunError::SelectionSyntax(_) | RunError::PlanConsistency(_)
        )
    }
}

/// Result alias for orchestrator operations.
pub type RunResult<T> = Result<T, RunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_run_id_is_lifted() {
        let id = Uuid::new_v4();
        let err = RunError::from(StoreError::DuplicateRunId { run_id: id });
        assert!(matches!(err, RunError::DuplicateRunId { run_id } if run_id == id));
    }

    #[test]
    fn test_execution_error_becomes_abort() {
        let err = RunError::from(ExecutionError::Aborted {
            reason: "out of memory".to_string(),
            transient: false,
        });
        assert_eq!(err.to_string(), "Execution aborted: out of memory");
        assert!(err.partial_summary().is_none());
        assert!(!err.is_validation());
    }

    #[test]
    fn test_validation_errors() {
        let err = RunError::from(ConfigurationError::UnknownEnvironment("qa".to_string()));
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "Unknown environment: qa");
    }
}
