//! Transformation engine interface.
//!
//! An engine is invoked once per run attempt and answers with a lazy stream
//! of [`EngineEvent`]s. The stream ends when the engine is done; a
//! [`EngineEvent::RunFatal`] means no further progress will be reported.
//!
//! - [`DbtCliEngine`]: spawns the dbt executable and translates its JSON log
//! - [`ScriptedEngine`]: replays canned event sequences

mod dbt;
mod dbt_log;
mod scripted;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::plan::RunPlan;
use crate::records::NodeStatus;

pub use dbt::DbtCliEngine;
pub use dbt_log::DbtLogTranslator;
pub use scripted::{ScriptedAttempt, ScriptedEngine};

/// Event reported by the engine while a run progresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    NodeStarted {
        model: String,
        at: DateTime<Utc>,
    },
    NodeCompleted {
        model: String,
        status: NodeStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        rows: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Start time as reported by the engine, when it has one.
        #[serde(skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    RunFatal {
        message: String,
        /// Connection-level failure before any work happened.
        transient: bool,
    },
}

impl EngineEvent {
    pub fn started(model: impl Into<String>) -> Self {
        Self::NodeStarted {
            model: model.into(),
            at: Utc::now(),
        }
    }

    pub fn completed(model: impl Into<String>, status: NodeStatus) -> Self {
        Self::NodeCompleted {
            model: model.into(),
            status,
            rows: None,
            error: None,
            started_at: None,
            at: Utc::now(),
        }
    }

    pub fn succeeded(model: impl Into<String>, rows: Option<i64>) -> Self {
        Self::NodeCompleted {
            model: model.into(),
            status: NodeStatus::Succeeded,
            rows,
            error: None,
            started_at: None,
            at: Utc::now(),
        }
    }

    pub fn failed(model: impl Into<String>, error: impl Into<String>) -> Self {
        Self::NodeCompleted {
            model: model.into(),
            status: NodeStatus::Failed,
            rows: None,
            error: Some(error.into()),
            started_at: None,
            at: Utc::now(),
        }
    }

    pub fn skipped(model: impl Into<String>) -> Self {
        Self::completed(model, NodeStatus::Skipped)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::RunFatal {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::RunFatal {
            message: message.into(),
            transient: true,
        }
    }
}

/// Lazy, finite, non-restartable event sequence.
pub type EventStream = BoxStream<'static, EngineEvent>;

/// The engine could not be started for this attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Could not reach the warehouse or engine backend; worth retrying.
    #[error("Engine connection error: {0}")]
    Connection(String),

    /// The engine itself is missing or failed to start.
    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Everything the engine needs for one attempt, derived from a [`RunPlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInvocation {
    pub run_id: Uuid,
    pub target: String,
    /// Normalized `--select` value, `None` for everything.
    pub select: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl EngineInvocation {
    pub fn from_plan(plan: &RunPlan) -> Self {
        Self {
            run_id: plan.run_id,
            target: plan.profile.target.name.clone(),
            select: plan.selector.to_engine_arg(),
            args: plan.engine_args(),
            env: plan.engine_env(),
            working_dir: plan.project_dir.as_ref().map(PathBuf::from),
        }
    }
}

/// Opaque transformation engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Start one run attempt.
    async fn invoke(&self, invocation: &EngineInvocation) -> Result<EventStream, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_helpers() {
        match EngineEvent::succeeded("orders", Some(12)) {
            EngineEvent::NodeCompleted { model, status, rows, .. } => {
                assert_eq!(model, "orders");
                assert_eq!(status, NodeStatus::Succeeded);
                assert_eq!(rows, Some(12));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            EngineEvent::transient("refused"),
            EngineEvent::RunFatal {
                message: "refused".to_string(),
                transient: true
            }
        );
    }

    #[test]
    fn test_error_transience() {
        assert!(EngineError::Connection("refused".to_string()).is_transient());
        assert!(!EngineError::Unavailable("no dbt".to_string()).is_transient());
    }
}
