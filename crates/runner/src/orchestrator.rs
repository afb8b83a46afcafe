//! Run orchestration.
//!
//! Sequences one run end to end:
//! - Resolving the profile for the target environment
//! - Compiling the selector (and optional exclude)
//! - Building the immutable run plan
//! - Executing it, with whole-run retries on transient engine failures
//! - Persisting plan and records, and summarizing from what was stored

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::engine::Engine;
use crate::environment::Environment;
use crate::error::{RunError, RunResult};
use crate::executor::{ExecutionError, RunExecutor};
use crate::plan::{ExecutionPlanner, PlanOptions, RunPlan};
use crate::records::{RunRecord, RunState, RunSummary};
use crate::result_ext::ResultExt;
use crate::selector::SelectorCompiler;
use crate::store::{MetadataStore, MetadataStoreAdapter};
use crate::variables::{ConfigurationError, KeySpec, VariableResolver, VariableStore};

/// How the execution phase of a run ended.
enum Finish {
    Completed(Result<(), ExecutionError>),
    Interrupted(&'static str),
}

/// Runs dbt plans for OTAP environments and records their results.
#[derive(Clone)]
pub struct RunOrchestrator {
    resolver: VariableResolver,
    compiler: SelectorCompiler,
    executor: RunExecutor,
    store: MetadataStoreAdapter,
    keys: Vec<KeySpec>,
    project_dir: Option<String>,
    profiles_dir: Option<String>,
}

impl RunOrchestrator {
    /// Create an orchestrator requesting the default dbt profile keys.
    pub fn new(
        variables: Arc<dyn VariableStore>,
        engine: Arc<dyn Engine>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            resolver: VariableResolver::new(variables),
            compiler: SelectorCompiler,
            executor: RunExecutor::new(engine),
            store: MetadataStoreAdapter::new(store),
            keys: KeySpec::dbt_profile(),
            project_dir: None,
            profiles_dir: None,
        }
    }

    /// Replace the requested key set.
    pub fn with_keys(mut self, keys: Vec<KeySpec>) -> Self {
        self.keys = keys;
        self
    }

    /// Project and profiles directories used when the profile sets none.
    pub fn with_dirs(mut self, project_dir: Option<String>, profiles_dir: Option<String>) -> Self {
        self.project_dir = project_dir;
        self.profiles_dir = profiles_dir;
        self
    }

    pub fn store(&self) -> &MetadataStoreAdapter {
        &self.store
    }

    /// Resolve, compile and plan without executing anything.
    ///
    /// Configuration and selector errors surface here, before any engine
    /// or store call.
    pub async fn prepare(
        &self,
        environment: &Environment,
        selector_text: &str,
        config: &RunConfig,
        run_id: Option<Uuid>,
    ) -> RunResult<RunPlan> {
        let profile = self
            .resolver
            .resolve(environment, &self.keys)
            .await
            .log(format!("resolving profile for {}", environment))?;

        let selector = self
            .compiler
            .compile(selector_text)
            .log("compiling selector")?;
        let exclude = match config.exclude.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => {
                Some(self.compiler.compile(text).log("compiling exclude selector")?)
            }
            _ => None,
        };
        if !config.command.supports_selection() && (!selector.is_all() || exclude.is_some()) {
            return Err(ConfigurationError::InvalidValue {
                key: "command".to_string(),
                reason: format!("dbt {} does not take a selection", config.command),
            }
            .into());
        }

        let options = PlanOptions::from_config(config, exclude)
            .with_dirs(self.project_dir.clone(), self.profiles_dir.clone());
        let plan = ExecutionPlanner::new(options)
            .plan(environment, profile, selector, run_id)
            .log("building run plan")?;
        Ok(plan)
    }

    /// Run `selector_text` against `environment`.
    ///
    /// Mixed node statuses are not an error: the returned summary carries the
    /// outcome. Errors are returned only when the run could not be planned,
    /// executed or stored.
    pub async fn run(
        &self,
        environment: &Environment,
        selector_text: &str,
        config: &RunConfig,
    ) -> RunResult<RunSummary> {
        self.run_with_cancel(environment, selector_text, config, std::future::pending())
            .await
    }

    /// Like [`run`](Self::run), but stops waiting on the engine once `cancel`
    /// completes. Records received by then are persisted and the summary
    /// reports [`crate::records::RunOutcome::Cancelled`].
    pub async fn run_with_cancel<F>(
        &self,
        environment: &Environment,
        selector_text: &str,
        config: &RunConfig,
        cancel: F,
    ) -> RunResult<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let plan = self.prepare(environment, selector_text, config, None).await?;
        self.execute_plan(&plan, config, cancel).await
    }

    /// Execute an already prepared plan.
    pub async fn execute_plan<F>(
        &self,
        plan: &RunPlan,
        config: &RunConfig,
        cancel: F,
    ) -> RunResult<RunSummary>
    where
        F: Future<Output = ()>,
    {
        if config.dry_run {
            info!(
                run_id = %plan.run_id,
                environment = %plan.environment,
                selector = %plan.selector_text(),
                "Dry run: plan validated, nothing executed"
            );
            return Ok(RunSummary::dry_run(plan.run_id, plan.environment.clone()));
        }

        info!(
            run_id = %plan.run_id,
            environment = %plan.environment,
            command = %plan.command,
            selector = %plan.selector_text(),
            "Starting dbt run"
        );

        let mut records = Vec::new();
        let finish = tokio::select! {
            result = self.execute_with_retries(plan, config, &mut records) => Finish::Completed(result),
            _ = cancel => Finish::Interrupted("cancelled by caller"),
            _ = wait_for_timeout(config.timeout()) => Finish::Interrupted("timed out"),
        };

        match finish {
            Finish::Completed(Ok(())) => {
                let summary = self
                    .store
                    .persist(plan, &records, RunState::Completed)
                    .await
                    .log("persisting run metadata")?;
                info!(
                    run_id = %plan.run_id,
                    outcome = %summary.outcome,
                    succeeded = summary.counts.succeeded,
                    failed = summary.counts.failed,
                    skipped = summary.counts.skipped,
                    "dbt run finished"
                );
                debug!(
                    target: "fabric_dbt.performance",
                    run_id = %plan.run_id,
                    duration_ms = summary.duration_ms,
                    "Run duration"
                );
                Ok(summary)
            }
            Finish::Completed(Err(e)) => {
                warn!(
                    run_id = %plan.run_id,
                    records = records.len(),
                    error = %e,
                    "Run aborted, persisting partial records"
                );
                let persisted = self.store.persist(plan, &records, RunState::Aborted).await;
                let summary = match persisted {
                    Ok(summary) => Some(Box::new(summary)),
                    Err(persist_err) => {
                        warn!(
                            run_id = %plan.run_id,
                            error = %persist_err,
                            "Could not persist partial records"
                        );
                        None
                    }
                };
                Err(RunError::ExecutionAborted {
                    reason: e.reason(),
                    summary,
                })
            }
            Finish::Interrupted(why) => {
                warn!(run_id = %plan.run_id, records = records.len(), reason = why, "Run interrupted");
                let summary = self
                    .store
                    .persist(plan, &records, RunState::Cancelled)
                    .await
                    .log("persisting cancelled run")?;
                Ok(summary)
            }
        }
    }

    /// Summary of a stored run.
    pub async fn summary(&self, run_id: Uuid) -> RunResult<Option<RunSummary>> {
        Ok(self.store.summary(run_id).await?)
    }

    /// Drive the executor, retrying the whole run while the failure is
    /// transient and no record has been produced yet.
    async fn execute_with_retries(
        &self,
        plan: &RunPlan,
        config: &RunConfig,
        records: &mut Vec<RunRecord>,
    ) -> Result<(), ExecutionError> {
        let mut attempt = 0u32;
        loop {
            match self.drive(plan, records).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && records.is_empty() && attempt < config.max_retries => {
                    attempt += 1;
                    let delay = config.retry_delay(attempt);
                    warn!(
                        run_id = %plan.run_id,
                        attempt,
                        max_retries = config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient engine failure, retrying run"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_transient() && records.is_empty() {
                        tracing::error!(
                            run_id = %plan.run_id,
                            attempts = attempt + 1,
                            error = %e,
                            "Engine still unreachable after all retries"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn drive(&self, plan: &RunPlan, records: &mut Vec<RunRecord>) -> Result<(), ExecutionError> {
        let mut stream = self.executor.execute(plan).await?;
        while let Some(next) = stream.next_record().await {
            records.push(next?);
        }
        Ok(())
    }
}

async fn wait_for_timeout(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineEvent, ScriptedEngine};
    use crate::environment::OtapStage;
    use crate::plan::DbtCommand;
    use crate::records::{NodeStatus, RunOutcome};
    use crate::store::InMemoryMetadataStore;
    use crate::variables::{InMemoryVariableStore, Scope, ScopeLayer, VarValue};

    fn variables() -> Arc<InMemoryVariableStore> {
        Arc::new(InMemoryVariableStore::new(vec![ScopeLayer::new(Scope::Global)
            .with("target.name", VarValue::String("fabric".to_string()))
            .with("target.schema", VarValue::String("analytics".to_string()))
            .with("target.threads", VarValue::Integer(4))]))
    }

    #[tokio::test]
    async fn test_run_persists_and_summarizes() {
        let engine = Arc::new(ScriptedEngine::with_events(vec![
            EngineEvent::started("orders"),
            EngineEvent::succeeded("orders", Some(10)),
        ]));
        let store = Arc::new(InMemoryMetadataStore::new());
        let orchestrator = RunOrchestrator::new(variables(), engine, store.clone());
        let env = Environment::new(OtapStage::Development, "sales");

        let summary = orchestrator
            .run(&env, "orders", &RunConfig::default())
            .await
            .unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.counts.succeeded, 1);

        let stored = store.records_for_run(summary.run_id).await.unwrap();
        assert_eq!(stored[0].rows_affected, Some(10));
        assert_eq!(orchestrator.summary(summary.run_id).await.unwrap(), Some(summary));
    }

    #[tokio::test]
    async fn test_selector_error_stops_before_engine() {
        let engine = Arc::new(ScriptedEngine::default());
        let orchestrator = RunOrchestrator::new(
            variables(),
            engine.clone(),
            Arc::new(InMemoryMetadataStore::new()),
        );
        let env = Environment::new(OtapStage::Test, "sales");

        let err = orchestrator
            .run(&env, "tag:", &RunConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::SelectionSyntax(_)));
        assert!(engine.invocations().await.is_empty());
    }

    #[tokio::test]
    async fn test_exclude_is_part_of_plan() {
        let orchestrator = RunOrchestrator::new(
            variables(),
            Arc::new(ScriptedEngine::default()),
            Arc::new(InMemoryMetadataStore::new()),
        )
        .with_dirs(Some("/work/dbt".to_string()), None);
        let config = RunConfig {
            exclude: Some("tag:nightly".to_string()),
            ..RunConfig::default()
        };
        let env = Environment::new(OtapStage::Acceptance, "sales");

        let plan = orchestrator.prepare(&env, "orders+", &config, None).await.unwrap();
        assert_eq!(plan.selector_text(), "orders+ --exclude tag:nightly");
        assert_eq!(plan.project_dir.as_deref(), Some("/work/dbt"));
    }

    #[tokio::test]
    async fn test_deps_rejects_selection() {
        let engine = Arc::new(ScriptedEngine::with_events(vec![]));
        let orchestrator = RunOrchestrator::new(
            variables(),
            engine.clone(),
            Arc::new(InMemoryMetadataStore::new()),
        );
        let env = Environment::new(OtapStage::Development, "sales");
        let config = RunConfig {
            command: DbtCommand::Deps,
            ..RunConfig::default()
        };

        let err = orchestrator.run(&env, "orders", &config).await.unwrap_err();
        assert!(err.is_validation());
        assert!(engine.invocations().await.is_empty());

        let summary = orchestrator.run(&env, "", &config).await.unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.counts.total(), 0);
        let invocations = engine.invocations().await;
        assert_eq!(invocations[0].args[2], "deps");
    }

    #[tokio::test]
    async fn test_fatal_surfaces_abort_with_partial_summary() {
        let engine = Arc::new(ScriptedEngine::with_events(vec![
            EngineEvent::succeeded("a", None),
            EngineEvent::fatal("Database Error: disk full"),
        ]));
        let store = Arc::new(InMemoryMetadataStore::new());
        let orchestrator = RunOrchestrator::new(variables(), engine, store.clone());
        let env = Environment::new(OtapStage::Production, "sales");

        let err = orchestrator
            .run(&env, "a b", &RunConfig::default())
            .await
            .unwrap_err();
        let summary = err.partial_summary().cloned().unwrap();
        assert_eq!(summary.counts.succeeded, 1);
        assert_eq!(summary.outcome, RunOutcome::Failed);
        assert!(!summary.is_success());
        assert_eq!(
            store.records_for_run(summary.run_id).await.unwrap()[0].status,
            NodeStatus::Succeeded
        );
        let stored = orchestrator.summary(summary.run_id).await.unwrap().unwrap();
        assert_eq!(stored.outcome, RunOutcome::Failed);
        assert!(matches!(err, RunError::ExecutionAborted { reason, .. } if reason.contains("disk full")));
    }
}
