//! fabric-dbt command line.
//!
//! Runs a dbt project for one OTAP environment, prints run plans, and
//! queries the run metadata and table layout of the lakehouse.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use fabric_dbt_runner::engine::DbtCliEngine;
use fabric_dbt_runner::store::{
    DuckDbMetadataStore, InMemoryMetadataStore, MetadataStore, MetadataStoreAdapter, PlanRow,
};
use fabric_dbt_runner::variables::{EnvVariableStore, VariableStore, YamlVariableLibrary};
use fabric_dbt_runner::{
    DbtCommand, Environment, LakehouseConfig, OtapStage, RunConfig, RunOrchestrator, RunOutcome,
    RunRecord, RunSummary, RunnerSettings,
};

#[derive(Parser)]
#[command(name = "fabric-dbt")]
#[command(version, about = "Environment-aware dbt runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a dbt selection against one environment
    ///
    /// Examples:
    ///     fabric-dbt run --env dev --select "+orders"
    ///     fabric-dbt run --env prod --select "tag:nightly" --exclude "tag:slow" --fail-fast
    ///     fabric-dbt run --env test --select "orders+" --command build --timeout 3600
    #[command(verbatim_doc_comment)]
    Run {
        #[command(flatten)]
        target: TargetArgs,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build the run plan and print it (credentials redacted) without running
    Plan {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Query stored run metadata
    ///
    /// Examples:
    ///     fabric-dbt history --run-id 6f1c...
    ///     fabric-dbt history --env prod --since 2024-05-01T00:00:00Z
    ///     fabric-dbt history --model orders
    #[command(verbatim_doc_comment)]
    History {
        /// Show one run with its records
        #[arg(long, conflicts_with_all = ["env", "model"])]
        run_id: Option<Uuid>,

        /// List runs of one environment (dev, test, acc, prod)
        #[arg(short, long, conflicts_with = "model")]
        env: Option<OtapStage>,

        /// Only runs requested at or after this RFC 3339 time
        #[arg(long, requires = "env")]
        since: Option<DateTime<Utc>>,

        /// Only runs requested before this RFC 3339 time
        #[arg(long, requires = "env")]
        until: Option<DateTime<Utc>>,

        /// List records of one model across runs
        #[arg(short, long)]
        model: Option<String>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the attached lakehouse layout and its managed tables
    ///
    /// Examples:
    ///     fabric-dbt lakehouse
    ///     fabric-dbt lakehouse --table orders
    #[command(verbatim_doc_comment)]
    Lakehouse {
        /// Print the storage location of one table
        #[arg(short, long)]
        table: Option<String>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Target environment: dev, test, acc or prod
    #[arg(short, long)]
    env: OtapStage,

    /// Workspace id (defaults to FABRIC_DBT_WORKSPACE_ID)
    #[arg(short, long)]
    workspace: Option<String>,

    /// Selector expression; empty selects every model
    #[arg(short, long, default_value = "")]
    select: String,

    /// Selector expression to exclude
    #[arg(long)]
    exclude: Option<String>,

    /// dbt sub-command: run, build, test, seed, snapshot, compile, deps or debug
    #[arg(short, long)]
    command: Option<DbtCommand>,

    /// Rebuild incremental models from scratch
    #[arg(long)]
    full_refresh: bool,

    /// Stop at the first failed node
    #[arg(long)]
    fail_fast: bool,

    /// Whole-run retries on transient engine connection failures
    #[arg(long)]
    max_retries: Option<u32>,

    /// Validate the plan without executing it
    #[arg(long)]
    dry_run: bool,

    /// Cancel the run after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
}

impl TargetArgs {
    fn environment(&self, settings: &RunnerSettings) -> Environment {
        let workspace = self
            .workspace
            .clone()
            .unwrap_or_else(|| settings.workspace_id.clone());
        Environment::new(self.env, workspace)
    }

    /// Options from `FABRIC_DBT_RUN_*`, overridden by flags.
    fn run_config(&self) -> Result<RunConfig> {
        let mut config = RunConfig::from_env().context("Failed to load FABRIC_DBT_RUN_* options")?;
        if let Some(command) = self.command {
            config.command = command;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = Some(timeout);
        }
        if self.exclude.is_some() {
            config.exclude = self.exclude.clone();
        }
        config.full_refresh |= self.full_refresh;
        config.fail_fast |= self.fail_fast;
        config.dry_run |= self.dry_run;
        Ok(config)
    }
}

fn build_orchestrator(settings: &RunnerSettings, store: Arc<dyn MetadataStore>) -> RunOrchestrator {
    let variables: Arc<dyn VariableStore> = match &settings.variable_library {
        Some(path) => Arc::new(YamlVariableLibrary::new(path.clone())),
        None => Arc::new(EnvVariableStore::from_env(settings.library_name.clone())),
    };
    let engine = DbtCliEngine::new(settings.executable.clone())
        .with_logs_dir(settings.lakehouse.logs_dir(), settings.log_flush_every);

    RunOrchestrator::new(variables, Arc::new(engine), store).with_dirs(
        Some(settings.project_dir.display().to_string()),
        Some(settings.profiles_dir().display().to_string()),
    )
}

fn open_store(settings: &RunnerSettings) -> Result<Arc<dyn MetadataStore>> {
    let path = settings.metadata_db();
    let store = DuckDbMetadataStore::open(&path)
        .with_context(|| format!("Failed to open metadata store at {}", path.display()))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fabric_dbt_runner=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = RunnerSettings::from_env().context("Failed to load FABRIC_DBT_* settings")?;

    match cli.command {
        Commands::Run { target, json } => run(&settings, &target, json).await,
        Commands::Plan { target } => {
            print_plan(&settings, &target).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::History {
            run_id,
            env,
            since,
            until,
            model,
            json,
        } => {
            let store = MetadataStoreAdapter::new(open_store(&settings)?);
            if let Some(run_id) = run_id {
                show_run(&store, run_id, json).await?;
            } else if let Some(stage) = env {
                list_runs(&store, stage, since, until, json).await?;
            } else if let Some(model) = model {
                list_model(&store, &model, json).await?;
            } else {
                anyhow::bail!("history needs one of --run-id, --env or --model");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Lakehouse { table, json } => {
            show_lakehouse(&settings.lakehouse, table.as_deref(), json).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(settings: &RunnerSettings, target: &TargetArgs, json: bool) -> Result<ExitCode> {
    let config = target.run_config()?;
    let environment = target.environment(settings);
    let store = if config.dry_run {
        Arc::new(InMemoryMetadataStore::new()) as Arc<dyn MetadataStore>
    } else {
        open_store(settings)?
    };
    let orchestrator = build_orchestrator(settings, store);

    tracing::info!(
        environment = %environment,
        selector = %target.select,
        command = %config.command,
        dry_run = config.dry_run,
        "Starting fabric-dbt run"
    );

    let cancel = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Interrupt received, cancelling run"),
            Err(e) => {
                tracing::warn!(error = %e, "Could not install Ctrl-C handler");
                std::future::pending::<()>().await
            }
        }
    };

    match orchestrator
        .run_with_cancel(&environment, &target.select, &config, cancel)
        .await
    {
        Ok(summary) => {
            print_summary(&summary, json)?;
            Ok(match summary.outcome {
                RunOutcome::Succeeded | RunOutcome::DryRun => ExitCode::SUCCESS,
                RunOutcome::Failed | RunOutcome::Cancelled => ExitCode::FAILURE,
            })
        }
        Err(e) => {
            if let Some(summary) = e.partial_summary() {
                print_summary(summary, json)?;
            }
            Err(e).with_context(|| format!("dbt run for {} failed", environment))
        }
    }
}

async fn print_plan(settings: &RunnerSettings, target: &TargetArgs) -> Result<()> {
    let config = target.run_config()?;
    let orchestrator = build_orchestrator(settings, Arc::new(InMemoryMetadataStore::new()));
    let plan = orchestrator
        .prepare(&target.environment(settings), &target.select, &config, None)
        .await
        .context("Failed to build run plan")?;

    let mut output = plan.redacted();
    if let Some(map) = output.as_object_mut() {
        map.insert("engine_args".to_string(), serde_json::json!(plan.engine_args()));
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    println!("Run {} ({}): {}", summary.run_id, summary.environment, summary.outcome);
    println!(
        "  succeeded: {}  failed: {}  skipped: {}",
        summary.counts.succeeded, summary.counts.failed, summary.counts.skipped
    );
    if summary.counts.unexpectedly_skipped > 0 {
        println!("  interrupted: {}", summary.counts.unexpectedly_skipped);
    }
    println!("  duration: {:.1}s", summary.duration_secs());
    Ok(())
}

fn print_records(records: &[RunRecord]) {
    for record in records {
        let rows = record
            .rows_affected
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<40} {:<10} {:>8}ms rows={} {}",
            record.model_name,
            record.status,
            record.duration_ms(),
            rows,
            record.error_message.as_deref().unwrap_or("")
        );
    }
}

async fn show_run(store: &MetadataStoreAdapter, run_id: Uuid, json: bool) -> Result<()> {
    let plan = store
        .store()
        .get_plan(run_id)
        .await?
        .with_context(|| format!("No run with id {}", run_id))?;
    let records = store.store().records_for_run(run_id).await?;
    let summary =
        RunSummary::from_records(run_id, plan.environment(), &records).with_state(plan.state);

    if json {
        let output = serde_json::json!({
            "plan": plan,
            "summary": summary,
            "records": records,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Run {} requested {}", run_id, plan.requested_at.to_rfc3339());
    println!("  environment: {}", plan.environment());
    println!("  command: {}  selector: {}", plan.command, plan.selector_text);
    println!("  state: {}", plan.state);
    print_summary(&summary, false)?;
    print_records(&records);
    Ok(())
}

async fn list_runs(
    store: &MetadataStoreAdapter,
    stage: OtapStage,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    json: bool,
) -> Result<()> {
    let plans: Vec<PlanRow> = store.store().plans_for_environment(stage, since, until).await?;

    let mut rows = Vec::with_capacity(plans.len());
    for plan in plans {
        let summary = store.summary(plan.run_id).await?;
        rows.push((plan, summary));
    }

    if json {
        let output: Vec<_> = rows
            .iter()
            .map(|(plan, summary)| serde_json::json!({ "plan": plan, "summary": summary }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No runs for {}", stage);
        return Ok(());
    }
    for (plan, summary) in rows {
        let outcome = summary
            .map(|s| s.outcome.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "{}  {}  {:<10} {:<8} {}",
            plan.requested_at.to_rfc3339(),
            plan.run_id,
            outcome,
            plan.command,
            plan.selector_text
        );
    }
    Ok(())
}

async fn list_model(store: &MetadataStoreAdapter, model: &str, json: bool) -> Result<()> {
    let records = store.store().records_for_model(model).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No records for model {}", model);
        return Ok(());
    }
    for record in &records {
        println!("{}  run {}", record.started_at.to_rfc3339(), record.run_id);
        print_records(std::slice::from_ref(record));
    }
    Ok(())
}

async fn show_lakehouse(lakehouse: &LakehouseConfig, table: Option<&str>, json: bool) -> Result<()> {
    if let Some(table) = table {
        let location = lakehouse.table_location(table);
        if json {
            let output = serde_json::json!({ "table": table, "location": location });
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            println!("{}", location.display());
        }
        return Ok(());
    }

    let info = lakehouse.info();
    let tables = lakehouse
        .list_tables()
        .await
        .with_context(|| format!("Failed to list tables in {}", info.tables_path.display()))?;

    if json {
        let output = serde_json::json!({ "lakehouse": info, "tables": tables });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Lakehouse {} at {}", info.name, info.path.display());
    println!("  tables: {}", info.tables_path.display());
    println!("  files:  {}", info.files_path.display());
    println!("  logs:   {}", info.logs_path.display());
    if tables.is_empty() {
        println!("No tables");
    }
    for table in &tables {
        println!("  {}", table);
    }
    Ok(())
}
