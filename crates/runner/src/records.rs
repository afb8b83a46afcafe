//! Per-node run records and the summary derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::environment::Environment;

/// Final status of one model node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps both stored names and dbt node statuses.
///
/// Anything unrecognized counts as a failure so that an unknown status can
/// never turn into a reported success.
impl From<&str> for NodeStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "succeeded" | "success" | "pass" | "warn" => Self::Succeeded,
            "skipped" | "skip" => Self::Skipped,
            _ => Self::Failed,
        }
    }
}

/// Outcome of one model node within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub model_name: String,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RunRecord {
    /// A skip is unexpected when it carries a reason of its own instead of
    /// following an upstream failure.
    pub fn is_unexpected_skip(&self) -> bool {
        self.status == NodeStatus::Skipped && self.error_message.is_some()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0)
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
    /// The plan was built and validated but nothing was executed.
    DryRun,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::DryRun => write!(f, "dry_run"),
        }
    }
}

/// How the execution phase of a run ended, stored with its plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// The engine reported until the end; the outcome follows the records.
    #[default]
    Completed,
    /// The engine aborted or could not be reached.
    Aborted,
    /// The caller stopped waiting.
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown stored values read as aborted, never as completed.
impl From<&str> for RunState {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Aborted,
        }
    }
}

/// Record counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Subset of `skipped`.
    pub unexpectedly_skipped: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// Aggregate over the records of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub environment: Environment,
    pub counts: StatusCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub outcome: RunOutcome,
}

impl RunSummary {
    /// Derive the summary from `records`.
    ///
    /// Succeeded only when nothing failed and nothing was unexpectedly skipped.
    pub fn from_records(run_id: Uuid, environment: Environment, records: &[RunRecord]) -> Self {
        let mut counts = StatusCounts::default();
        for record in records {
            match record.status {
                NodeStatus::Succeeded => counts.succeeded += 1,
                NodeStatus::Failed => counts.failed += 1,
                NodeStatus::Skipped => {
                    counts.skipped += 1;
                    if record.is_unexpected_skip() {
                        counts.unexpectedly_skipped += 1;
                    }
                }
            }
        }

        let started_at = records.iter().map(|r| r.started_at).min();
        let ended_at = records.iter().map(|r| r.ended_at).max();
        let duration_ms = match (started_at, ended_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0),
            _ => 0,
        };

        let outcome = if counts.failed == 0 && counts.unexpectedly_skipped == 0 {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        };

        Self {
            run_id,
            environment,
            counts,
            started_at,
            ended_at,
            duration_ms,
            outcome,
        }
    }

    /// Summary of a plan that was never executed.
    pub fn dry_run(run_id: Uuid, environment: Environment) -> Self {
        Self {
            outcome: RunOutcome::DryRun,
            ..Self::from_records(run_id, environment, &[])
        }
    }

    /// Apply the stored terminal state: an aborted run is failed whatever
    /// its records say, a cancelled one is cancelled.
    pub fn with_state(mut self, state: RunState) -> Self {
        match state {
            RunState::Completed => {}
            RunState::Aborted => self.outcome = RunOutcome::Failed,
            RunState::Cancelled => self.outcome = RunOutcome::Cancelled,
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_ms as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::OtapStage;
    use chrono::Duration;

    fn record(run_id: Uuid, name: &str, status: NodeStatus, offset_secs: i64) -> RunRecord {
        let start = DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::seconds(offset_secs);
        RunRecord {
            run_id,
            model_name: name.to_string(),
            status,
            started_at: start,
            ended_at: start + Duration::seconds(2),
            rows_affected: None,
            error_message: None,
        }
    }

    fn env() -> Environment {
        Environment::new(OtapStage::Test, "sales")
    }

    #[test]
    fn test_status_from_dbt() {
        assert_eq!(NodeStatus::from("success"), NodeStatus::Succeeded);
        assert_eq!(NodeStatus::from("pass"), NodeStatus::Succeeded);
        assert_eq!(NodeStatus::from("error"), NodeStatus::Failed);
        assert_eq!(NodeStatus::from("skipped"), NodeStatus::Skipped);
        assert_eq!(NodeStatus::from("something-new"), NodeStatus::Failed);
    }

    #[test]
    fn test_summary_all_succeeded() {
        let id = Uuid::new_v4();
        let records = vec![
            record(id, "a", NodeStatus::Succeeded, 0),
            record(id, "b", NodeStatus::Succeeded, 3),
        ];
        let summary = RunSummary::from_records(id, env(), &records);
        assert_eq!(summary.outcome, RunOutcome::Succeeded);
        assert_eq!(summary.counts.total(), 2);
        assert_eq!(summary.duration_ms, 5000);
    }

    #[test]
    fn test_summary_failure_and_expected_skip() {
        let id = Uuid::new_v4();
        let records = vec![
            record(id, "a", NodeStatus::Failed, 0),
            record(id, "b", NodeStatus::Skipped, 2),
        ];
        let summary = RunSummary::from_records(id, env(), &records);
        assert_eq!(summary.outcome, RunOutcome::Failed);
        assert_eq!(summary.counts.failed, 1);
        assert_eq!(summary.counts.skipped, 1);
        assert_eq!(summary.counts.unexpectedly_skipped, 0);
    }

    #[test]
    fn test_unexpected_skip_fails_run() {
        let id = Uuid::new_v4();
        let mut skipped = record(id, "a", NodeStatus::Skipped, 0);
        skipped.error_message = Some("interrupted".to_string());
        let summary = RunSummary::from_records(id, env(), &[skipped]);
        assert_eq!(summary.counts.unexpectedly_skipped, 1);
        assert_eq!(summary.outcome, RunOutcome::Failed);
    }

    #[test]
    fn test_aborted_state_never_succeeds() {
        let id = Uuid::new_v4();
        let records = vec![record(id, "a", NodeStatus::Succeeded, 0)];
        let summary = RunSummary::from_records(id, env(), &records).with_state(RunState::Aborted);
        assert_eq!(summary.outcome, RunOutcome::Failed);
        assert_eq!(summary.counts.succeeded, 1);

        let empty = RunSummary::from_records(id, env(), &[]).with_state(RunState::Aborted);
        assert_eq!(empty.outcome, RunOutcome::Failed);
    }

    #[test]
    fn test_cancelled_and_completed_states() {
        let id = Uuid::new_v4();
        let records = vec![record(id, "a", NodeStatus::Failed, 0)];
        let cancelled = RunSummary::from_records(id, env(), &records).with_state(RunState::Cancelled);
        assert_eq!(cancelled.outcome, RunOutcome::Cancelled);
        let completed = RunSummary::from_records(id, env(), &records).with_state(RunState::Completed);
        assert_eq!(completed.outcome, RunOutcome::Failed);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(RunState::from("cancelled"), RunState::Cancelled);
        assert_eq!(RunState::from(RunState::Completed.as_str()), RunState::Completed);
        assert_eq!(RunState::from("garbage"), RunState::Aborted);
    }

    #[test]
    fn test_empty_summary() {
        let summary = RunSummary::dry_run(Uuid::new_v4(), env());
        assert_eq!(summary.outcome, RunOutcome::DryRun);
        assert_eq!(summary.counts.total(), 0);
        assert_eq!(summary.duration_ms, 0);
        assert!(summary.started_at.is_none());
    }
}
