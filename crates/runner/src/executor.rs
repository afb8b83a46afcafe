//! Run execution: engine events in, run records out.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use thiserror::Error;
use uuid::Uuid;

use crate::engine::{Engine, EngineError, EngineEvent, EngineInvocation, EventStream};
use crate::plan::RunPlan;
use crate::records::{NodeStatus, RunRecord};

/// Errors raised while executing a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The engine reported a fatal condition mid-run.
    #[error("Execution aborted: {reason}")]
    Aborted { reason: String, transient: bool },

    /// The engine could not be started.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ExecutionError {
    /// Whether retrying the whole run may help.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Aborted { transient, .. } => *transient,
            Self::Engine(e) => e.is_transient(),
        }
    }

    pub fn reason(&self) -> String {
        match self {
            Self::Aborted { reason, .. } => reason.clone(),
            Self::Engine(e) => e.to_string(),
        }
    }
}

/// Invokes the engine for a plan.
#[derive(Clone)]
pub struct RunExecutor {
    engine: Arc<dyn Engine>,
}

impl RunExecutor {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Start executing `plan`.
    ///
    /// Fails only when the engine cannot be started. Everything after that
    /// is reported through the returned [`RecordStream`].
    pub async fn execute(&self, plan: &RunPlan) -> Result<RecordStream, ExecutionError> {
        let invocation = EngineInvocation::from_plan(plan);
        let events = self.engine.invoke(&invocation).await?;
        tracing::info!(run_id = %plan.run_id, environment = %plan.environment, "Execution started");
        Ok(RecordStream::new(plan.run_id, events, plan.fail_fast))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Aborting,
    Done,
}

/// Lazy, finite, non-restartable sequence of run records.
///
/// One record per node completion. Nodes that started but never completed
/// are emitted as skipped, with the reason attached, when the engine stops
/// reporting (end of stream, fatal error or fail-fast stop). After a fatal
/// engine error, every record produced before it is yielded first, then a
/// single [`ExecutionError::Aborted`], then nothing.
pub struct RecordStream {
    run_id: Uuid,
    events: EventStream,
    fail_fast: bool,
    in_flight: BTreeMap<String, DateTime<Utc>>,
    pending: VecDeque<RunRecord>,
    abort: Option<ExecutionError>,
    state: State,
    produced: usize,
}

impl RecordStream {
    pub fn new(run_id: Uuid, events: EventStream, fail_fast: bool) -> Self {
        Self {
            run_id,
            events,
            fail_fast,
            in_flight: BTreeMap::new(),
            pending: VecDeque::new(),
            abort: None,
            state: State::Running,
            produced: 0,
        }
    }

    /// Records yielded so far.
    pub fn produced(&self) -> usize {
        self.produced
    }

    /// Await the next record.
    pub async fn next_record(&mut self) -> Option<Result<RunRecord, ExecutionError>> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                self.produced += 1;
                tracing::debug!(
                    run_id = %record.run_id,
                    model = %record.model_name,
                    status = %record.status,
                    "Node completed"
                );
                return Some(Ok(record));
            }

            match self.state {
                State::Done => return None,
                State::Aborting => {
                    self.state = State::Done;
                    return self.abort.take().map(Err);
                }
                State::Running => {}
            }

            match self.events.next().await {
                None => {
                    self.drain_in_flight("Engine stopped before the node completed");
                    self.stop(State::Done);
                }
                Some(EngineEvent::NodeStarted { model, at }) => {
                    self.in_flight.insert(model, at);
                }
                Some(EngineEvent::NodeCompleted {
                    model,
                    status,
                    rows,
                    error,
                    started_at,
                    at,
                }) => {
                    let tracked = self.in_flight.remove(&model);
                    let started_at = started_at.or(tracked).unwrap_or(at);
                    self.pending.push_back(RunRecord {
                        run_id: self.run_id,
                        model_name: model,
                        status,
                        started_at,
                        ended_at: at.max(started_at),
                        rows_affected: rows,
                        error_message: error,
                    });

                    if self.fail_fast && status == NodeStatus::Failed {
                        tracing::info!(run_id = %self.run_id, "Stopping after first failure");
                        self.drain_in_flight("Interrupted after an upstream failure (fail fast)");
                        self.stop(State::Done);
                    }
                }
                Some(EngineEvent::RunFatal { message, transient }) => {
                    tracing::error!(
                        run_id = %self.run_id,
                        transient,
                        error = %message,
                        "Engine aborted the run"
                    );
                    self.drain_in_flight(&format!("Interrupted: {}", message));
                    self.abort = Some(ExecutionError::Aborted {
                        reason: message,
                        transient,
                    });
                    self.stop(State::Aborting);
                }
            }
        }
    }

    /// Collect every remaining record, stopping at the first error.
    pub async fn collect_records(mut self) -> (Vec<RunRecord>, Option<ExecutionError>) {
        let mut records = Vec::new();
        while let Some(next) = self.next_record().await {
            match next {
                Ok(record) => records.push(record),
                Err(e) => return (records, Some(e)),
            }
        }
        (records, None)
    }

    fn stop(&mut self, state: State) {
        self.state = state;
        // dropping the engine stream tells the engine to stop
        self.events = stream::empty().boxed();
    }

    fn drain_in_flight(&mut self, reason: &str) {
        let now = Utc::now();
        for (model, started_at) in std::mem::take(&mut self.in_flight) {
            self.pending.push_back(RunRecord {
                run_id: self.run_id,
                model_name: model,
                status: NodeStatus::Skipped,
                started_at,
                ended_at: now.max(started_at),
                rows_affected: None,
                error_message: Some(reason.to_string()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScriptedEngine;

    fn records_stream(events: Vec<EngineEvent>, fail_fast: bool) -> RecordStream {
        RecordStream::new(Uuid::new_v4(), stream::iter(events).boxed(), fail_fast)
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_records() {
        let stream = records_stream(
            vec![
                EngineEvent::started("model_a"),
                EngineEvent::failed("model_a", "Database Error"),
                EngineEvent::skipped("model_b"),
                EngineEvent::started("model_c"),
                EngineEvent::succeeded("model_c", Some(3)),
            ],
            false,
        );
        let (records, error) = stream.collect_records().await;
        assert!(error.is_none());
        let statuses: Vec<_> = records.iter().map(|r| (r.model_name.as_str(), r.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("model_a", NodeStatus::Failed),
                ("model_b", NodeStatus::Skipped),
                ("model_c", NodeStatus::Succeeded),
            ]
        );
        assert_eq!(records[2].rows_affected, Some(3));
        assert!(!records[1].is_unexpected_skip());
    }

    #[tokio::test]
    async fn test_fatal_emits_prior_records_then_error() {
        let mut stream = records_stream(
            vec![
                EngineEvent::succeeded("a", None),
                EngineEvent::started("b"),
                EngineEvent::fatal("out of memory"),
                EngineEvent::succeeded("never", None),
            ],
            false,
        );

        let first = stream.next_record().await.unwrap().unwrap();
        assert_eq!(first.model_name, "a");

        let interrupted = stream.next_record().await.unwrap().unwrap();
        assert_eq!(interrupted.model_name, "b");
        assert_eq!(interrupted.status, NodeStatus::Skipped);
        assert!(interrupted.is_unexpected_skip());

        let err = stream.next_record().await.unwrap().unwrap_err();
        assert_eq!(
            err,
            ExecutionError::Aborted {
                reason: "out of memory".to_string(),
                transient: false
            }
        );
        assert!(stream.next_record().await.is_none());
        assert_eq!(stream.produced(), 2);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_after_first_failure() {
        let stream = records_stream(
            vec![
                EngineEvent::started("a"),
                EngineEvent::started("b"),
                EngineEvent::failed("a", "boom"),
                EngineEvent::succeeded("b", None),
            ],
            true,
        );
        let (records, error) = stream.collect_records().await;
        assert!(error.is_none());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, NodeStatus::Failed);
        assert_eq!(records[1].model_name, "b");
        assert_eq!(records[1].status, NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn test_unfinished_nodes_at_stream_end() {
        let stream = records_stream(vec![EngineEvent::started("orphan")], false);
        let (records, _) = stream.collect_records().await;
        assert_eq!(records.len(), 1);
        assert!(records[0].is_unexpected_skip());
    }

    #[tokio::test]
    async fn test_start_time_from_node_started() {
        let started = EngineEvent::started("a");
        let at = match &started {
            EngineEvent::NodeStarted { at, .. } => *at,
            _ => unreachable!(),
        };
        let stream = records_stream(vec![started, EngineEvent::succeeded("a", None)], false);
        let (records, _) = stream.collect_records().await;
        assert_eq!(records[0].started_at, at);
        assert!(records[0].ended_at >= records[0].started_at);
    }

    #[tokio::test]
    async fn test_executor_surfaces_engine_start_failure() {
        use crate::environment::{Environment, OtapStage};
        use crate::plan::ExecutionPlanner;
        use crate::selector::compile;
        use crate::variables::{ResolvedProfile, TargetProfile};

        let env = Environment::new(OtapStage::Development, "ws");
        let profile = ResolvedProfile {
            environment: env.clone(),
            target: TargetProfile {
                name: "dev".to_string(),
                database: None,
                schema: "dbt_dev".to_string(),
                threads: 1,
            },
            credential: None,
            project_dir: None,
            profiles_dir: None,
            vars: Default::default(),
            values: Default::default(),
        };
        let plan = ExecutionPlanner::default()
            .plan(&env, profile, compile("a").unwrap(), None)
            .unwrap();

        let engine = Arc::new(ScriptedEngine::new([crate::engine::ScriptedAttempt::Fail(
            EngineError::Connection("refused".to_string()),
        )]));
        let executor = RunExecutor::new(engine.clone());
        let err = executor.execute(&plan).await.err().unwrap();
        assert!(err.is_transient());
        assert_eq!(engine.invocations().await[0].run_id, plan.run_id);
    }
}
