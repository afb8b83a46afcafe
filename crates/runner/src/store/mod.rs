//! Run metadata persistence.
//!
//! Plans and records land in two lakehouse tables:
//!
//! ```text
//! run_plans   (run_id PK, environment, workspace_id, profile_snapshot,
//!              selector_text, command, requested_at, run_state)
//! run_records (run_id, model_name, status, started_at, ended_at,
//!              rows_affected, error_message, PK (run_id, model_name))
//! ```
//!
//! Writes are upserts keyed by `(run_id, model_name)`. A run id belongs to
//! exactly one plan; writing a different plan under the same id fails with
//! [`StoreError::DuplicateRunId`]. `run_state` records how the last write
//! ended (completed, aborted or cancelled) and overrides the outcome derived
//! from records.

mod lakehouse;
mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::environment::{Environment, OtapStage};
use crate::plan::RunPlan;
use crate::records::{RunRecord, RunState, RunSummary};

pub use lakehouse::{DuckDbMetadataStore, DEFAULT_DB_FILE};
pub use memory::InMemoryMetadataStore;

/// Metadata store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The run id is already taken by a different plan.
    #[error("Run id {run_id} already belongs to a different plan")]
    DuplicateRunId { run_id: Uuid },

    /// Rejected input, such as a record for another run.
    #[error("Invalid write: {0}")]
    Invalid(String),

    /// Storage backend failure.
    #[error("Metadata store error: {0}")]
    Database(String),

    /// A stored value could not be decoded.
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

impl From<duckdb::Error> for StoreError {
    fn from(e: duckdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Fixed-width UTC timestamp text, so lexical order is time order.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

/// Row of the `run_plans` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRow {
    pub run_id: Uuid,
    pub environment: OtapStage,
    pub workspace_id: String,
    /// Resolved profile with credentials redacted.
    pub profile_snapshot: serde_json::Value,
    pub selector_text: String,
    pub command: String,
    pub requested_at: DateTime<Utc>,
    /// Terminal state of the most recent write; not part of plan identity.
    pub state: RunState,
}

impl PlanRow {
    pub fn from_plan(plan: &RunPlan, state: RunState) -> Self {
        Self {
            run_id: plan.run_id,
            environment: plan.environment.stage,
            workspace_id: plan.environment.workspace.clone(),
            profile_snapshot: plan.profile_snapshot(),
            selector_text: plan.selector_text(),
            command: plan.command.to_string(),
            requested_at: plan.requested_at,
            state,
        }
    }

    pub fn environment(&self) -> Environment {
        Environment::new(self.environment, self.workspace_id.clone())
    }

    /// Same plan identity: environment, profile and selection.
    pub fn same_plan(&self, other: &PlanRow) -> bool {
        self.run_id == other.run_id
            && self.environment == other.environment
            && self.workspace_id == other.workspace_id
            && self.profile_snapshot == other.profile_snapshot
            && self.selector_text == other.selector_text
    }
}

/// Shared duplicate check for store implementations.
pub(crate) fn check_plan_identity(existing: Option<&PlanRow>, plan: &PlanRow) -> Result<(), StoreError> {
    match existing {
        Some(existing) if !existing.same_plan(plan) => {
            tracing::warn!(run_id = %plan.run_id, "Run id reused for a different plan");
            Err(StoreError::DuplicateRunId { run_id: plan.run_id })
        }
        _ => Ok(()),
    }
}

/// Lakehouse metadata tables.
///
/// `write_run` is the only write path and must be atomic per call: the plan
/// identity check and all record upserts happen under one lock or
/// transaction, so concurrent writes for the same run serialize.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert the plan if new (otherwise update its state), then upsert `records`.
    async fn write_run(&self, plan: &PlanRow, records: &[RunRecord]) -> Result<(), StoreError>;

    async fn get_plan(&self, run_id: Uuid) -> Result<Option<PlanRow>, StoreError>;

    /// Records of one run, ordered by start time then model name.
    async fn records_for_run(&self, run_id: Uuid) -> Result<Vec<RunRecord>, StoreError>;

    /// Plans for one stage requested within `[from, to)`, oldest first.
    async fn plans_for_environment(
        &self,
        stage: OtapStage,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<PlanRow>, StoreError>;

    /// Every record of `model_name` across runs, oldest first.
    async fn records_for_model(&self, model_name: &str) -> Result<Vec<RunRecord>, StoreError>;
}

/// Persists plans and records and derives summaries from what was stored.
#[derive(Clone)]
pub struct MetadataStoreAdapter {
    store: Arc<dyn MetadataStore>,
}

impl MetadataStoreAdapter {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Upsert `plan` and `records` with the run's terminal `state`, then
    /// summarize the run from store contents.
    pub async fn persist(
        &self,
        plan: &RunPlan,
        records: &[RunRecord],
        state: RunState,
    ) -> Result<RunSummary, StoreError> {
        if let Some(stray) = records.iter().find(|r| r.run_id != plan.run_id) {
            return Err(StoreError::Invalid(format!(
                "record for {} belongs to run {}, not {}",
                stray.model_name, stray.run_id, plan.run_id
            )));
        }

        // last write wins within one batch too
        let mut latest: BTreeMap<&str, &RunRecord> = BTreeMap::new();
        for record in records {
            latest.insert(record.model_name.as_str(), record);
        }
        let batch: Vec<RunRecord> = latest.into_values().cloned().collect();

        let start = std::time::Instant::now();
        self.store.write_run(&PlanRow::from_plan(plan, state), &batch).await?;
        let stored = self.store.records_for_run(plan.run_id).await?;

        tracing::debug!(
            target: "fabric_dbt.performance",
            run_id = %plan.run_id,
            records = batch.len(),
            state = %state,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Run metadata persisted"
        );
        Ok(RunSummary::from_records(plan.run_id, plan.environment.clone(), &stored).with_state(state))
    }

    /// Recompute the summary of a stored run.
    pub async fn summary(&self, run_id: Uuid) -> Result<Option<RunSummary>, StoreError> {
        let Some(plan) = self.store.get_plan(run_id).await? else {
            return Ok(None);
        };
        let records = self.store.records_for_run(run_id).await?;
        Ok(Some(
            RunSummary::from_records(run_id, plan.environment(), &records).with_state(plan.state),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_text_sorts_by_time() {
        let early = parse_ts("2024-05-01T08:00:00Z").unwrap();
        let late = parse_ts("2024-05-01T10:00:00.5Z").unwrap();
        assert!(format_ts(&early) < format_ts(&late));
        assert_eq!(format_ts(&early), "2024-05-01T08:00:00.000000Z");
        assert_eq!(parse_ts(&format_ts(&late)).unwrap(), late);
    }

    #[test]
    fn test_corrupt_timestamp() {
        assert!(matches!(parse_ts("yesterday"), Err(StoreError::Corrupt(_))));
    }
}
