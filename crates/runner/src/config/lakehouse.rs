//! Lakehouse location and layout.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lakehouse attached to the notebook session.
///
/// - `FABRIC_LAKEHOUSE_NAME` (default: "default")
/// - `FABRIC_LAKEHOUSE_PATH` (default: "/lakehouse/default")
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LakehouseConfig {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_path")]
    pub path: PathBuf,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_path() -> PathBuf {
    PathBuf::from("/lakehouse/default")
}

impl LakehouseConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("FABRIC_LAKEHOUSE_").from_env::<LakehouseConfig>()
    }

    /// Managed tables area.
    pub fn tables_dir(&self) -> PathBuf {
        self.path.join("Tables")
    }

    /// Unmanaged files area.
    pub fn files_dir(&self) -> PathBuf {
        self.path.join("Files")
    }

    /// Where run logs are written.
    pub fn logs_dir(&self) -> PathBuf {
        self.files_dir().join("dbt_logs")
    }

    /// Storage location of one managed table.
    pub fn table_location(&self, table: &str) -> PathBuf {
        self.tables_dir().join(table)
    }

    /// Managed tables, one directory each, sorted by name. A lakehouse
    /// without a `Tables/` area has none.
    pub async fn list_tables(&self) -> io::Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(self.tables_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut tables = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                tables.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        tables.sort();
        Ok(tables)
    }

    pub fn info(&self) -> LakehouseInfo {
        LakehouseInfo {
            name: self.name.clone(),
            path: self.path.clone(),
            tables_path: self.tables_dir(),
            files_path: self.files_dir(),
            logs_path: self.logs_dir(),
        }
    }
}

/// Lakehouse layout as shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LakehouseInfo {
    pub name: String,
    pub path: PathBuf,
    pub tables_path: PathBuf,
    pub files_path: PathBuf,
    pub logs_path: PathBuf,
}

impl Default for LakehouseConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            path: default_path(),
        }
    }
}
