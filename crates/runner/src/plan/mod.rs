//! Run plans.
//!
//! A [`RunPlan`] pins down everything the engine is invoked with: target,
//! schema, threads, vars, selection and the dbt sub-command. Plans are built
//! once by the [`ExecutionPlanner`] and never modified afterwards.

mod command;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::RunConfig;
use crate::environment::Environment;
use crate::sanitize::sanitize_sensitive_data;
use crate::selector::CompiledSelector;
use crate::variables::ResolvedProfile;

pub use command::DbtCommand;

/// Environment variable carrying the credential handle to the engine process.
pub const CREDENTIAL_ENV: &str = "DBT_CREDENTIAL_REF";

/// The profile handed to the planner was resolved for another environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Plan for {plan_environment} cannot use a profile resolved for {profile_environment}")]
pub struct PlanConsistencyError {
    pub plan_environment: Environment,
    pub profile_environment: Environment,
}

/// Invocation options that are not part of the resolved profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanOptions {
    pub command: DbtCommand,
    pub full_refresh: bool,
    pub fail_fast: bool,
    pub exclude: Option<CompiledSelector>,
    /// Used when the profile does not set `dbt.project_dir`.
    pub default_project_dir: Option<String>,
    /// Used when the profile does not set `dbt.profiles_dir`.
    pub default_profiles_dir: Option<String>,
}

impl PlanOptions {
    pub fn from_config(config: &RunConfig, exclude: Option<CompiledSelector>) -> Self {
        Self {
            command: config.command,
            full_refresh: config.full_refresh,
            fail_fast: config.fail_fast,
            exclude,
            ..Self::default()
        }
    }

    pub fn with_dirs(mut self, project_dir: Option<String>, profiles_dir: Option<String>) -> Self {
        self.default_project_dir = project_dir;
        self.default_profiles_dir = profiles_dir;
        self
    }
}

/// Immutable description of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPlan {
    pub run_id: Uuid,
    pub environment: Environment,
    pub profile: ResolvedProfile,
    pub selector: CompiledSelector,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<CompiledSelector>,
    pub requested_at: DateTime<Utc>,
    pub command: DbtCommand,
    pub full_refresh: bool,
    pub fail_fast: bool,
    pub project_dir: Option<String>,
    pub profiles_dir: Option<String>,
    /// Models named explicitly by the selector.
    pub expected_models: Vec<String>,
}

impl RunPlan {
    /// Profile as persisted and displayed, with credentials redacted.
    pub fn profile_snapshot(&self) -> serde_json::Value {
        match serde_json::to_value(&self.profile) {
            Ok(value) => sanitize_sensitive_data(&value),
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        }
    }

    /// Selection as stored with the plan: the selector text plus any exclusion.
    pub fn selector_text(&self) -> String {
        match &self.exclude {
            Some(exclude) => format!("{} --exclude {}", self.selector.text, exclude.text),
            None => self.selector.text.clone(),
        }
    }

    /// Whole plan with credentials redacted.
    pub fn redacted(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(value) => sanitize_sensitive_data(&value),
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        }
    }

    /// `--vars` payload, keys in sorted order.
    pub fn vars_json(&self) -> Option<String> {
        if self.profile.vars.is_empty() {
            return None;
        }
        let map: serde_json::Map<String, serde_json::Value> = self
            .profile
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some(serde_json::Value::Object(map).to_string())
    }

    /// dbt argument vector, without the executable.
    pub fn engine_args(&self) -> Vec<String> {
        let mut args = vec![
            "--log-format".to_string(),
            "json".to_string(),
            self.command.to_string(),
        ];

        if let Some(dir) = &self.project_dir {
            args.extend(["--project-dir".to_string(), dir.clone()]);
        }
        if let Some(dir) = &self.profiles_dir {
            args.extend(["--profiles-dir".to_string(), dir.clone()]);
        }
        args.extend(["--target".to_string(), self.profile.target.name.clone()]);
        let graph = self.command.supports_selection();
        if graph {
            args.extend(["--threads".to_string(), self.profile.target.threads.to_string()]);
        }
        if let Some(vars) = self.vars_json() {
            args.extend(["--vars".to_string(), vars]);
        }
        if !graph {
            return args;
        }

        if let Some(select) = self.selector.to_engine_arg() {
            args.extend(["--select".to_string(), select]);
        }
        if let Some(exclude) = self.exclude.as_ref().and_then(|e| e.to_engine_arg()) {
            args.extend(["--exclude".to_string(), exclude]);
        }
        if self.full_refresh && self.command.supports_full_refresh() {
            args.push("--full-refresh".to_string());
        }
        if self.fail_fast {
            args.push("--fail-fast".to_string());
        }
        args
    }

    /// Variables exported to the engine process.
    pub fn engine_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("DBT_TARGET_SCHEMA".to_string(), self.profile.target.schema.clone()),
            ("DBT_ENVIRONMENT".to_string(), self.environment.stage.short_name().to_string()),
        ];
        if let Some(database) = &self.profile.target.database {
            env.push(("DBT_TARGET_DATABASE".to_string(), database.clone()));
        }
        if let Some(credential) = &self.profile.credential {
            env.push((CREDENTIAL_ENV.to_string(), credential.handle().to_string()));
        }
        env
    }
}

/// Builds run plans.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlanner {
    options: PlanOptions,
}

impl ExecutionPlanner {
    pub fn new(options: PlanOptions) -> Self {
        Self { options }
    }

    /// Combine a profile and selector into a plan for `environment`.
    ///
    /// Generates a v4 run id when `run_id` is `None`.
    pub fn plan(
        &self,
        environment: &Environment,
        profile: ResolvedProfile,
        selector: CompiledSelector,
        run_id: Option<Uuid>,
    ) -> Result<RunPlan, PlanConsistencyError> {
        if profile.environment != *environment {
            return Err(PlanConsistencyError {
                plan_environment: environment.clone(),
                profile_environment: profile.environment.clone(),
            });
        }

        let run_id = run_id.unwrap_or_else(Uuid::new_v4);
        let expected_models = selector
            .expr
            .model_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let project_dir = profile
            .project_dir
            .clone()
            .or_else(|| self.options.default_project_dir.clone());
        let profiles_dir = profile
            .profiles_dir
            .clone()
            .or_else(|| self.options.default_profiles_dir.clone());

        let plan = RunPlan {
            run_id,
            environment: environment.clone(),
            profile,
            selector,
            exclude: self.options.exclude.clone(),
            requested_at: Utc::now(),
            command: self.options.command,
            full_refresh: self.options.full_refresh,
            fail_fast: self.options.fail_fast,
            project_dir,
            profiles_dir,
            expected_models,
        };

        tracing::debug!(
            run_id = %plan.run_id,
            environment = %plan.environment,
            command = %plan.command,
            selector = %plan.selector_text(),
            "Run plan created"
        );
        Ok(plan)
    }
}
