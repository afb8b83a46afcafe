//! Fabric dbt Runner
//!
//! Runs a dbt project against one OTAP environment (dev, test, acc, prod)
//! and records what happened in lakehouse metadata tables.
//!
//! This crate provides:
//! - Hierarchical variable resolution into a per-environment dbt profile
//! - A selector DSL compiled into an engine-agnostic expression tree
//! - Immutable run plans with the exact dbt invocation
//! - Engine adapters (dbt CLI and a scripted engine for tests)
//! - Idempotent run metadata persistence (DuckDB or in memory)
//! - The orchestrator tying it together with retry and cancellation

pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod plan;
pub mod records;
pub mod result_ext;
pub mod run_log;
pub mod sanitize;
pub mod selector;
pub mod store;
pub mod variables;

pub use config::{LakehouseConfig, RunConfig, RunnerSettings};
pub use environment::{Environment, OtapStage};
pub use error::{RunError, RunResult};
pub use orchestrator::RunOrchestrator;
pub use plan::{DbtCommand, RunPlan};
pub use records::{NodeStatus, RunOutcome, RunRecord, RunState, RunSummary};
