//! DuckDB-backed metadata tables in the lakehouse `Tables/` area.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::{params, params_from_iter, Connection, Row};
use uuid::Uuid;

use crate::config::LakehouseConfig;
use crate::environment::OtapStage;
use crate::records::{NodeStatus, RunRecord, RunState};

use super::{check_plan_identity, format_ts, parse_ts, MetadataStore, PlanRow, StoreError};

/// Default database file name under `Tables/`.
pub const DEFAULT_DB_FILE: &str = "dbt_run_metadata.duckdb";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS run_plans (
    run_id VARCHAR PRIMARY KEY,
    environment VARCHAR NOT NULL,
    workspace_id VARCHAR NOT NULL,
    profile_snapshot VARCHAR NOT NULL,
    selector_text VARCHAR NOT NULL,
    command VARCHAR NOT NULL,
    requested_at VARCHAR NOT NULL,
    run_state VARCHAR NOT NULL
);
CREATE TABLE IF NOT EXISTS run_records (
    run_id VARCHAR NOT NULL,
    model_name VARCHAR NOT NULL,
    status VARCHAR NOT NULL,
    started_at VARCHAR NOT NULL,
    ended_at VARCHAR NOT NULL,
    rows_affected BIGINT,
    error_message VARCHAR,
    PRIMARY KEY (run_id, model_name)
);
"#;

const PLAN_COLUMNS: &str = "run_id, environment, workspace_id, profile_snapshot, selector_text, \
     command, requested_at, run_state";
const RECORD_COLUMNS: &str =
    "run_id, model_name, status, started_at, ended_at, rows_affected, error_message";

/// Raw `run_plans` row as stored.
struct PlanCols(String, String, String, String, String, String, String, String);

/// Raw `run_records` row as stored.
struct RecordCols(String, String, String, String, String, Option<i64>, Option<String>);

fn read_plan(row: &Row<'_>) -> duckdb::Result<PlanCols> {
    Ok(PlanCols(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn read_record(row: &Row<'_>) -> duckdb::Result<RecordCols> {
    Ok(RecordCols(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("run id '{}': {}", raw, e)))
}

fn plan_from_cols(cols: PlanCols) -> Result<PlanRow, StoreError> {
    let PlanCols(run_id, environment, workspace_id, snapshot, selector_text, command, requested_at, state) =
        cols;
    Ok(PlanRow {
        run_id: parse_uuid(&run_id)?,
        environment: environment
            .parse::<OtapStage>()
            .map_err(|e| StoreError::Corrupt(format!("environment: {}", e)))?,
        workspace_id,
        profile_snapshot: serde_json::from_str(&snapshot)
            .map_err(|e| StoreError::Corrupt(format!("profile snapshot: {}", e)))?,
        selector_text,
        command,
        requested_at: parse_ts(&requested_at)?,
        state: RunState::from(state.as_str()),
    })
}

fn record_from_cols(cols: RecordCols) -> Result<RunRecord, StoreError> {
    let RecordCols(run_id, model_name, status, started_at, ended_at, rows_affected, error_message) = cols;
    Ok(RunRecord {
        run_id: parse_uuid(&run_id)?,
        model_name,
        status: NodeStatus::from(status.as_str()),
        started_at: parse_ts(&started_at)?,
        ended_at: parse_ts(&ended_at)?,
        rows_affected,
        error_message,
    })
}

/// Metadata tables in a DuckDB file.
///
/// A single connection behind a mutex serializes writers; all database work
/// runs on the blocking pool.
#[derive(Clone)]
pub struct DuckDbMetadataStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl DuckDbMetadataStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "Opened run metadata store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open the default database under the lakehouse `Tables/` directory.
    pub fn for_lakehouse(lakehouse: &LakehouseConfig) -> Result<Self, StoreError> {
        Self::open(lakehouse.tables_dir().join(DEFAULT_DB_FILE))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` with the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Database(format!("Failed to acquire connection lock: {}", e)))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Database(format!("Metadata task failed: {}", e)))?
    }

    fn query_plans(
        conn: &Connection,
        sql: &str,
        args: &[String],
    ) -> Result<Vec<PlanRow>, StoreError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), read_plan)?;
        let mut plans = Vec::new();
        for row in rows {
            plans.push(plan_from_cols(row?)?);
        }
        Ok(plans)
    }

    fn query_records(
        conn: &Connection,
        sql: &str,
        args: &[String],
    ) -> Result<Vec<RunRecord>, StoreError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), read_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(record_from_cols(row?)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl MetadataStore for DuckDbMetadataStore {
    async fn write_run(&self, plan: &PlanRow, records: &[RunRecord]) -> Result<(), StoreError> {
        let plan = plan.clone();
        let records = records.to_vec();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let existing = Self::query_plans(
                &tx,
                &format!("SELECT {} FROM run_plans WHERE run_id = ?", PLAN_COLUMNS),
                &[plan.run_id.to_string()],
            )?;
            check_plan_identity(existing.first(), &plan)?;

            if existing.is_empty() {
                tx.execute(
                    &format!(
                        "INSERT INTO run_plans ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                        PLAN_COLUMNS
                    ),
                    params![
                        plan.run_id.to_string(),
                        plan.environment.short_name(),
                        plan.workspace_id,
                        plan.profile_snapshot.to_string(),
                        plan.selector_text,
                        plan.command,
                        format_ts(&plan.requested_at),
                        plan.state.as_str(),
                    ],
                )?;
            } else {
                tx.execute(
                    "UPDATE run_plans SET run_state = ? WHERE run_id = ?",
                    params![plan.state.as_str(), plan.run_id.to_string()],
                )?;
            }

            {
                let mut upsert = tx.prepare(&format!(
                    "INSERT OR REPLACE INTO run_records ({}) VALUES (?, ?, ?, ?, ?, ?, ?)",
                    RECORD_COLUMNS
                ))?;
                for record in &records {
                    upsert.execute(params![
                        record.run_id.to_string(),
                        record.model_name,
                        record.status.as_str(),
                        format_ts(&record.started_at),
                        format_ts(&record.ended_at),
                        record.rows_affected,
                        record.error_message,
                    ])?;
                }
            }

            tx.commit()?;
            tracing::debug!(
                run_id = %plan.run_id,
                records = records.len(),
                "Run written to lakehouse tables"
            );
            Ok(())
        })
        .await
    }

    async fn get_plan(&self, run_id: Uuid) -> Result<Option<PlanRow>, StoreError> {
        self.with_conn(move |conn| {
            let mut plans = Self::query_plans(
                conn,
                &format!("SELECT {} FROM run_plans WHERE run_id = ?", PLAN_COLUMNS),
                &[run_id.to_string()],
            )?;
            Ok(plans.pop())
        })
        .await
    }

    async fn records_for_run(&self, run_id: Uuid) -> Result<Vec<RunRecord>, StoreError> {
        self.with_conn(move |conn| {
            Self::query_records(
                conn,
                &format!(
                    "SELECT {} FROM run_records WHERE run_id = ? ORDER BY started_at, model_name",
                    RECORD_COLUMNS
                ),
                &[run_id.to_string()],
            )
        })
        .await
    }

    async fn plans_for_environment(
        &self,
        stage: OtapStage,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<PlanRow>, StoreError> {
        self.with_conn(move |conn| {
            let mut sql = format!("SELECT {} FROM run_plans WHERE environment = ?", PLAN_COLUMNS);
            let mut args = vec![stage.short_name().to_string()];
            if let Some(from) = from {
                sql.push_str(" AND requested_at >= ?");
                args.push(format_ts(&from));
            }
            if let Some(to) = to {
                sql.push_str(" AND requested_at < ?");
                args.push(format_ts(&to));
            }
            sql.push_str(" ORDER BY requested_at");
            Self::query_plans(conn, &sql, &args)
        })
        .await
    }

    async fn records_for_model(&self, model_name: &str) -> Result<Vec<RunRecord>, StoreError> {
        let model_name = model_name.to_string();
        self.with_conn(move |conn| {
            Self::query_records(
                conn,
                &format!(
                    "SELECT {} FROM run_records WHERE model_name = ? ORDER BY started_at, run_id",
                    RECORD_COLUMNS
                ),
                &[model_name],
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    fn plan_row(run_id: Uuid, selector: &str) -> PlanRow {
        PlanRow {
            run_id,
            environment: OtapStage::Acceptance,
            workspace_id: "finance".to_string(),
            profile_snapshot: serde_json::json!({"credential": "[REDACTED]", "target": {"threads": 4}}),
            selector_text: selector.to_string(),
            command: "build".to_string(),
            requested_at: ts("2024-05-01T06:00:00Z"),
            state: RunState::Completed,
        }
    }

    fn record(run_id: Uuid, model: &str, status: NodeStatus, rows: Option<i64>) -> RunRecord {
        RunRecord {
            run_id,
            model_name: model.to_string(),
            status,
            started_at: ts("2024-05-01T06:00:01Z"),
            ended_at: ts("2024-05-01T06:00:03Z"),
            rows_affected: rows,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_round_trip_and_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let lakehouse = LakehouseConfig::new("lh", dir.path());
        let store = DuckDbMetadataStore::for_lakehouse(&lakehouse).unwrap();
        assert!(store.path().unwrap().starts_with(dir.path().join("Tables")));

        let id = Uuid::new_v4();
        let plan = plan_row(id, "+orders");
        store
            .write_run(&plan, &[record(id, "orders", NodeStatus::Failed, None)])
            .await
            .unwrap();
        store
            .write_run(&plan, &[record(id, "orders", NodeStatus::Succeeded, Some(7))])
            .await
            .unwrap();

        let records = store.records_for_run(id).await.unwrap();
        assert_eq!(records, vec![record(id, "orders", NodeStatus::Succeeded, Some(7))]);
        assert_eq!(store.get_plan(id).await.unwrap(), Some(plan));
    }

    #[tokio::test]
    async fn test_duplicate_run_id() {
        let store = DuckDbMetadataStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store.write_run(&plan_row(id, "a"), &[]).await.unwrap();
        let err = store
            .write_run(&plan_row(id, "b"), &[record(id, "b", NodeStatus::Succeeded, None)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRunId { .. }));
        assert!(store.records_for_run(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_environment_window_and_model_history() {
        let store = DuckDbMetadataStore::open_in_memory().unwrap();
        let early = Uuid::new_v4();
        let late = Uuid::new_v4();

        let mut late_plan = plan_row(late, "x");
        late_plan.requested_at = late_plan.requested_at + Duration::hours(3);
        store
            .write_run(&plan_row(early, "x"), &[record(early, "orders", NodeStatus::Succeeded, None)])
            .await
            .unwrap();
        store
            .write_run(&late_plan, &[record(late, "orders", NodeStatus::Failed, None)])
            .await
            .unwrap();

        let all = store
            .plans_for_environment(OtapStage::Acceptance, None, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let window = store
            .plans_for_environment(
                OtapStage::Acceptance,
                Some(ts("2024-05-01T07:00:00Z")),
                Some(ts("2024-05-01T12:00:00Z")),
            )
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].run_id, late);

        assert!(store
            .plans_for_environment(OtapStage::Production, None, None)
            .await
            .unwrap()
            .is_empty());

        let history = store.records_for_model("orders").await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_state_is_updated() {
        let store = DuckDbMetadataStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        let mut plan = plan_row(id, "orders");
        plan.state = RunState::Aborted;
        store
            .write_run(&plan, &[record(id, "orders", NodeStatus::Succeeded, None)])
            .await
            .unwrap();
        assert_eq!(store.get_plan(id).await.unwrap().unwrap().state, RunState::Aborted);

        plan.state = RunState::Completed;
        store.write_run(&plan, &[]).await.unwrap();
        assert_eq!(store.get_plan(id).await.unwrap().unwrap().state, RunState::Completed);
    }

    #[tokio::test]
    async fn test_concurrent_writes_keep_one_row_per_node() {
        let dir = tempfile::tempdir().unwrap();
        let store = DuckDbMetadataStore::open(dir.path().join("meta.duckdb")).unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (plan_a, plan_b) = (plan_row(a, "x"), plan_row(b, "x"));

        let batch_a1 = [
            record(a, "orders", NodeStatus::Failed, None),
            record(a, "customers", NodeStatus::Succeeded, Some(3)),
        ];
        let batch_a2 = [record(a, "orders", NodeStatus::Succeeded, Some(9))];
        let batch_b = [record(b, "orders", NodeStatus::Skipped, None)];

        let (r1, r2, r3) = tokio::join!(
            store.write_run(&plan_a, &batch_a1),
            store.write_run(&plan_a, &batch_a2),
            store.write_run(&plan_b, &batch_b),
        );
        r1.unwrap();
        r2.unwrap();
        r3.unwrap();

        let run_a = store.records_for_run(a).await.unwrap();
        assert_eq!(run_a.len(), 2);
        let orders: Vec<_> = run_a.iter().filter(|r| r.model_name == "orders").collect();
        assert_eq!(orders.len(), 1);
        assert!(batch_a1[..1].contains(orders[0]) || batch_a2.contains(orders[0]));

        let run_b = store.records_for_run(b).await.unwrap();
        assert_eq!(run_b, batch_b.to_vec());
    }
}
