//! Variable library sources.
//!
//! A store hands back every scope layer it knows for a workspace; picking
//! the layers that apply to one environment is the resolver's job.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::environment::OtapStage;

use super::types::{RawValue, Scope, ScopeLayer, VarValue};
use super::ConfigurationError;

/// Hierarchical, read-only key-value configuration source.
#[async_trait]
pub trait VariableStore: Send + Sync {
    /// All scope layers visible to `workspace_id`, least specific first.
    async fn get_hierarchy(&self, workspace_id: &str) -> Result<Vec<ScopeLayer>, ConfigurationError>;
}

/// Variable store held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryVariableStore {
    layers: Vec<ScopeLayer>,
}

impl InMemoryVariableStore {
    pub fn new(layers: Vec<ScopeLayer>) -> Self {
        Self { layers }
    }

    pub fn push(&mut self, layer: ScopeLayer) {
        self.layers.push(layer);
    }
}

#[async_trait]
impl VariableStore for InMemoryVariableStore {
    async fn get_hierarchy(&self, workspace_id: &str) -> Result<Vec<ScopeLayer>, ConfigurationError> {
        Ok(self
            .layers
            .iter()
            .filter(|layer| match &layer.scope {
                Scope::Workspace(ws) => ws == workspace_id,
                _ => true,
            })
            .cloned()
            .collect())
    }
}

/// On-disk layout of a variable library file.
#[derive(Debug, Default, Deserialize)]
struct LibraryFile {
    #[serde(default)]
    global: BTreeMap<String, RawValue>,
    #[serde(default)]
    stages: BTreeMap<String, BTreeMap<String, RawValue>>,
    #[serde(default)]
    workspaces: BTreeMap<String, BTreeMap<String, RawValue>>,
}

fn to_layer(scope: Scope, entries: BTreeMap<String, RawValue>) -> ScopeLayer {
    ScopeLayer {
        scope,
        entries: entries
            .into_iter()
            .map(|(k, v)| (k, VarValue::from(v)))
            .collect(),
    }
}

/// Variable library stored as a YAML file.
///
/// ```yaml
/// global:
///   target.threads: 4
/// stages:
///   prod:
///     target.schema: analytics
///     target.credential: secret://kv-prod/dbt
/// workspaces:
///   sales:
///     vars.region: {type: string, value: emea}
/// ```
#[derive(Debug, Clone)]
pub struct YamlVariableLibrary {
    path: PathBuf,
}

impl YamlVariableLibrary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse library text into layers for one workspace.
    pub fn parse(text: &str, workspace_id: &str) -> Result<Vec<ScopeLayer>, ConfigurationError> {
        let file: LibraryFile = serde_yaml::from_str(text)
            .map_err(|e| ConfigurationError::Source(format!("Invalid variable library: {}", e)))?;

        let mut layers = vec![to_layer(Scope::Global, file.global)];

        let mut stages = Vec::new();
        for (name, entries) in file.stages {
            let stage: OtapStage = name.parse()?;
            stages.push((stage, entries));
        }
        stages.sort_by_key(|(stage, _)| *stage);
        layers.extend(
            stages
                .into_iter()
                .map(|(stage, entries)| to_layer(Scope::Stage(stage), entries)),
        );

        let mut workspaces = file.workspaces;
        if let Some(entries) = workspaces.remove(workspace_id) {
            layers.push(to_layer(Scope::Workspace(workspace_id.to_string()), entries));
        }

        Ok(layers)
    }
}

#[async_trait]
impl VariableStore for YamlVariableLibrary {
    async fn get_hierarchy(&self, workspace_id: &str) -> Result<Vec<ScopeLayer>, ConfigurationError> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ConfigurationError::Source(format!(
                "Failed to read variable library {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %self.path.display(), workspace = %workspace_id, "Loading variable library");
        Self::parse(&text, workspace_id)
    }
}

/// Variable library exposed through process environment variables.
///
/// With library name `dbt_config`:
/// - `DBT_CONFIG_TARGET_SCHEMA=analytics` sets `target.schema` globally
/// - `DBT_CONFIG__PROD__TARGET_SCHEMA=analytics` sets it for the prod stage
/// - `DBT_CONFIG_VARS={"a":1}` sets the `vars` JSON passthrough object
#[derive(Debug, Clone)]
pub struct EnvVariableStore {
    library_name: String,
    vars: Vec<(String, String)>,
}

impl EnvVariableStore {
    /// Snapshot the current process environment.
    pub fn from_env(library_name: impl Into<String>) -> Self {
        Self::from_vars(library_name, std::env::vars())
    }

    pub fn from_vars(
        library_name: impl Into<String>,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            library_name: library_name.into(),
            vars: vars.into_iter().collect(),
        }
    }

    fn prefix(&self) -> String {
        format!("{}_", self.library_name.to_uppercase())
    }
}

/// `TARGET_SCHEMA` -> `target.schema`, `VARS` -> `vars`.
fn env_key(raw: &str) -> String {
    raw.to_lowercase().replacen('_', ".", 1)
}

/// `vars` must hold a JSON object; other keys are inferred from their text.
fn env_value(key: &str, raw: &str) -> Result<VarValue, ConfigurationError> {
    if key != "vars" {
        return Ok(VarValue::infer_str(raw));
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v @ serde_json::Value::Object(_)) => Ok(VarValue::Json(v)),
        Ok(_) => Err(ConfigurationError::InvalidValue {
            key: key.to_string(),
            reason: "expected a JSON object".to_string(),
        }),
        Err(e) => Err(ConfigurationError::InvalidValue {
            key: key.to_string(),
            reason: format!("malformed JSON: {}", e),
        }),
    }
}

#[async_trait]
impl VariableStore for EnvVariableStore {
    async fn get_hierarchy(&self, _workspace_id: &str) -> Result<Vec<ScopeLayer>, ConfigurationError> {
        let prefix = self.prefix();
        let mut global = ScopeLayer::new(Scope::Global);
        let mut stages: BTreeMap<OtapStage, ScopeLayer> = BTreeMap::new();

        for (name, value) in &self.vars {
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };

            if let Some(scoped) = rest.strip_prefix('_') {
                let Some((stage, raw_key)) = scoped.split_once("__") else {
                    continue;
                };
                let stage: OtapStage = stage.parse()?;
                let key = env_key(raw_key);
                let value = env_value(&key, value)?;
                stages
                    .entry(stage)
                    .or_insert_with(|| ScopeLayer::new(Scope::Stage(stage)))
                    .entries
                    .insert(key, value);
            } else {
                let key = env_key(rest);
                let value = env_value(&key, value)?;
                global.entries.insert(key, value);
            }
        }

        let mut layers = vec![global];
        layers.extend(stages.into_values());
        Ok(layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::types::CredentialRef;

    const LIBRARY: &str = r#"
global:
  target.name: fabric
  target.threads: 4
stages:
  prod:
    target.schema: analytics
    target.credential: secret://kv-prod/dbt
  dev:
    target.schema: {type: string, value: dev_analytics}
workspaces:
  sales:
    vars.region: emea
  finance:
    vars.region: us
"#;

    #[test]
    fn test_parse_library_layers() {
        let layers = YamlVariableLibrary::parse(LIBRARY, "sales").unwrap();
        let scopes: Vec<Scope> = layers.iter().map(|l| l.scope.clone()).collect();
        assert_eq!(
            scopes,
            vec![
                Scope::Global,
                Scope::Stage(OtapStage::Development),
                Scope::Stage(OtapStage::Production),
                Scope::Workspace("sales".to_string()),
            ]
        );
        assert_eq!(
            layers[2].entries.get("target.credential"),
            Some(&VarValue::Secret(CredentialRef::new("secret://kv-prod/dbt")))
        );
    }

    #[test]
    fn test_parse_rejects_unknown_stage() {
        let err = YamlVariableLibrary::parse("stages:\n  staging:\n    a: 1\n", "x").unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownEnvironment(_)));
    }

    #[tokio::test]
    async fn test_yaml_library_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.yml");
        std::fs::write(&path, LIBRARY).unwrap();

        let store = YamlVariableLibrary::new(&path);
        let layers = store.get_hierarchy("finance").await.unwrap();
        let last = layers.last().unwrap();
        assert_eq!(last.scope, Scope::Workspace("finance".to_string()));
        assert_eq!(
            last.entries.get("vars.region"),
            Some(&VarValue::String("us".to_string()))
        );
    }

    #[tokio::test]
    async fn test_env_store() {
        let store = EnvVariableStore::from_vars(
            "dbt_config",
            vec![
                ("DBT_CONFIG_TARGET_THREADS".to_string(), "8".to_string()),
                ("DBT_CONFIG__PROD__TARGET_SCHEMA".to_string(), "analytics".to_string()),
                ("DBT_CONFIG_VARS".to_string(), r#"{"run_date": "2024-01-01"}"#.to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
            ],
        );

        let layers = store.get_hierarchy("any").await.unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].entries.get("target.threads"), Some(&VarValue::Integer(8)));
        assert_eq!(
            layers[0].entries.get("vars"),
            Some(&VarValue::Json(serde_json::json!({"run_date": "2024-01-01"})))
        );
        assert_eq!(layers[1].scope, Scope::Stage(OtapStage::Production));
        assert_eq!(
            layers[1].entries.get("target.schema"),
            Some(&VarValue::String("analytics".to_string()))
        );
    }

    #[tokio::test]
    async fn test_env_store_rejects_malformed_vars() {
        for raw in ["{not json", "[1, 2]"] {
            let store = EnvVariableStore::from_vars(
                "dbt_config",
                vec![("DBT_CONFIG_VARS".to_string(), raw.to_string())],
            );
            let err = store.get_hierarchy("any").await.unwrap_err();
            assert!(
                matches!(err, ConfigurationError::InvalidValue { ref key, .. } if key == "vars"),
                "{raw}: {err}"
            );
        }

        let store = EnvVariableStore::from_vars(
            "dbt_config",
            vec![("DBT_CONFIG__DEV__VARS".to_string(), "oops".to_string())],
        );
        assert!(store.get_hierarchy("any").await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_filters_other_workspaces() {
        let store = InMemoryVariableStore::new(vec![
            ScopeLayer::new(Scope::Global),
            ScopeLayer::new(Scope::Workspace("a".to_string())),
            ScopeLayer::new(Scope::Workspace("b".to_string())),
        ]);
        let layers = store.get_hierarchy("b").await.unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[1].scope, Scope::Workspace("b".to_string()));
    }
}
