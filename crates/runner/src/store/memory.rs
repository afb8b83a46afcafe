//! In-memory metadata store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::environment::OtapStage;
use crate::records::RunRecord;

use super::{check_plan_identity, MetadataStore, PlanRow, StoreError};

#[derive(Debug, Default)]
struct Tables {
    plans: BTreeMap<Uuid, PlanRow>,
    records: BTreeMap<(Uuid, String), RunRecord>,
}

/// Metadata store held in memory; one write lock per `write_run` call.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    tables: RwLock<Tables>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_records(records: &mut [RunRecord]) {
    records.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.model_name.cmp(&b.model_name))
    });
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn write_run(&self, plan: &PlanRow, records: &[RunRecord]) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        check_plan_identity(tables.plans.get(&plan.run_id), plan)?;
        tables
            .plans
            .entry(plan.run_id)
            .and_modify(|stored| stored.state = plan.state)
            .or_insert_with(|| plan.clone());
        for record in records {
            tables
                .records
                .insert((record.run_id, record.model_name.clone()), record.clone());
        }
        Ok(())
    }

    async fn get_plan(&self, run_id: Uuid) -> Result<Option<PlanRow>, StoreError> {
        Ok(self.tables.read().await.plans.get(&run_id).cloned())
    }

    async fn records_for_run(&self, run_id: Uuid) -> Result<Vec<RunRecord>, StoreError> {
        let tables = self.tables.read().await;
        let mut records: Vec<RunRecord> = tables
            .records
            .range((run_id, String::new())..)
            .take_while(|((id, _), _)| *id == run_id)
            .map(|(_, record)| record.clone())
            .collect();
        sort_records(&mut records);
        Ok(records)
    }

    async fn plans_for_environment(
        &self,
        stage: OtapStage,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<PlanRow>, StoreError> {
        let tables = self.tables.read().await;
        let mut plans: Vec<PlanRow> = tables
            .plans
            .values()
            .filter(|p| p.environment == stage)
            .filter(|p| from.map_or(true, |from| p.requested_at >= from))
            .filter(|p| to.map_or(true, |to| p.requested_at < to))
            .cloned()
            .collect();
        plans.sort_by_key(|p| p.requested_at);
        Ok(plans)
    }

    async fn records_for_model(&self, model_name: &str) -> Result<Vec<RunRecord>, StoreError> {
        let tables = self.tables.read().await;
        let mut records: Vec<RunRecord> = tables
            .records
            .values()
            .filter(|r| r.model_name == model_name)
            .cloned()
            .collect();
        sort_records(&mut records);
        Ok(records)
    }
}
