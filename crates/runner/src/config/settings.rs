//! Process-level runner settings.

use std::path::PathBuf;

use serde::Deserialize;

use super::LakehouseConfig;
use crate::store::DEFAULT_DB_FILE;

/// Settings shared by every run in this process.
///
/// Environment variables are prefixed with `FABRIC_DBT_`:
/// - `FABRIC_DBT_WORKSPACE_ID`: workspace the runs belong to (default: "default")
/// - `FABRIC_DBT_VARIABLE_LIBRARY`: YAML variable library file (optional)
/// - `FABRIC_DBT_LIBRARY_NAME`: env variable library prefix when no file is set (default: "dbt_config")
/// - `FABRIC_DBT_EXECUTABLE`: dbt binary (default: "dbt")
/// - `FABRIC_DBT_PROJECT_DIR`: dbt project directory (default: ".")
/// - `FABRIC_DBT_PROFILES_DIR`: dbt profiles directory (optional, defaults to the project dir)
/// - `FABRIC_DBT_METADATA_DB`: DuckDB metadata file (optional, defaults under the lakehouse `Tables/`)
/// - `FABRIC_DBT_LOG_FLUSH_EVERY`: run log lines buffered between flushes (default: 25)
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSettings {
    #[serde(default = "default_workspace_id")]
    pub workspace_id: String,

    #[serde(default)]
    pub variable_library: Option<PathBuf>,

    #[serde(default = "default_library_name")]
    pub library_name: String,

    #[serde(default = "default_executable")]
    pub executable: String,

    #[serde(default = "default_project_dir")]
    pub project_dir: PathBuf,

    #[serde(default)]
    pub profiles_dir: Option<PathBuf>,

    #[serde(default)]
    pub metadata_db: Option<PathBuf>,

    #[serde(default = "default_log_flush_every")]
    pub log_flush_every: usize,

    #[serde(skip)]
    pub lakehouse: LakehouseConfig,
}

fn default_workspace_id() -> String {
    "default".to_string()
}

fn default_library_name() -> String {
    "dbt_config".to_string()
}

fn default_executable() -> String {
    "dbt".to_string()
}

fn default_project_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_flush_every() -> usize {
    25
}

impl RunnerSettings {
    /// Load settings and the lakehouse location from the environment.
    pub fn from_env() -> Result<Self, envy::Error> {
        let mut settings = envy::prefixed("FABRIC_DBT_").from_env::<RunnerSettings>()?;
        settings.lakehouse = LakehouseConfig::from_env()?;
        Ok(settings)
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.profiles_dir
            .clone()
            .unwrap_or_else(|| self.project_dir.clone())
    }

    pub fn metadata_db(&self) -> PathBuf {
        self.metadata_db
            .clone()
            .unwrap_or_else(|| self.lakehouse.tables_dir().join(DEFAULT_DB_FILE))
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            workspace_id: default_workspace_id(),
            variable_library: None,
            library_name: default_library_name(),
            executable: default_executable(),
            project_dir: default_project_dir(),
            profiles_dir: None,
            metadata_db: None,
            log_flush_every: default_log_flush_every(),
            lakehouse: LakehouseConfig::default(),
        }
    }
}
