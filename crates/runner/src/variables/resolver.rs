//! Variable resolution into a per-environment profile.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::environment::Environment;

use super::store::VariableStore;
use super::types::{CredentialRef, KeySpec, Scope, ScopeLayer, ValueKind, VarValue};
use super::ConfigurationError;

/// Prefix of keys passed through to the engine as project variables.
pub const VARS_PREFIX: &str = "vars.";

/// Connection target section of a resolved profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetProfile {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub schema: String,
    pub threads: u32,
}

/// Flattened configuration for one environment.
///
/// Built once per run and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedProfile {
    pub environment: Environment,
    pub target: TargetProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles_dir: Option<String>,
    /// Engine passthrough variables (`vars.*` keys and the `vars` object).
    pub vars: BTreeMap<String, serde_json::Value>,
    /// Every requested key with its winning value.
    pub values: BTreeMap<String, VarValue>,
}

impl ResolvedProfile {
    pub fn get(&self, key: &str) -> Option<&VarValue> {
        self.values.get(key)
    }
}

/// Merge the layers that apply to `environment`, least specific first.
///
/// Global is the floor, then the environment's stage, then its workspace.
/// Within one precedence level, later layers win.
pub fn merge_layers(
    layers: &[ScopeLayer],
    environment: &Environment,
) -> BTreeMap<String, (VarValue, Scope)> {
    let mut applicable: Vec<&ScopeLayer> = layers
        .iter()
        .filter(|layer| match &layer.scope {
            Scope::Global => true,
            Scope::Stage(stage) => *stage == environment.stage,
            Scope::Workspace(ws) => *ws == environment.workspace,
        })
        .collect();
    // stable: keeps store order inside one level
    applicable.sort_by_key(|layer| layer.scope.rank());

    let mut merged = BTreeMap::new();
    for layer in applicable {
        for (key, value) in &layer.entries {
            merged.insert(key.clone(), (value.clone(), layer.scope.clone()));
        }
    }
    merged
}

/// Resolves profiles from a variable store.
#[derive(Clone)]
pub struct VariableResolver {
    store: Arc<dyn VariableStore>,
}

impl VariableResolver {
    pub fn new(store: Arc<dyn VariableStore>) -> Self {
        Self { store }
    }

    /// Resolve `requested` keys for `environment`.
    ///
    /// Fails on the first requested key (in key order) that is missing or
    /// carries the wrong type.
    pub async fn resolve(
        &self,
        environment: &Environment,
        requested: &[KeySpec],
    ) -> Result<ResolvedProfile, ConfigurationError> {
        let layers = self.store.get_hierarchy(&environment.workspace).await?;
        let merged = merge_layers(&layers, environment);

        let mut specs: Vec<&KeySpec> = requested.iter().collect();
        specs.sort_by(|a, b| a.key.cmp(&b.key));

        let mut values = BTreeMap::new();
        for spec in specs {
            match merged.get(&spec.key) {
                Some((value, scope)) => {
                    if !spec.accepts(value.kind()) {
                        return Err(ConfigurationError::TypeMismatch {
                            key: spec.key.clone(),
                            expected: spec.kind,
                            found: value.kind(),
                        });
                    }
                    tracing::trace!(key = %spec.key, scope = %scope, "Resolved variable");
                    values.insert(spec.key.clone(), value.clone());
                }
                None if spec.required => {
                    return Err(ConfigurationError::MissingKey {
                        key: spec.key.clone(),
                        environment: environment.to_string(),
                    });
                }
                None => {}
            }
        }

        let vars = passthrough_vars(&merged)?;
        let profile = build_profile(environment, values, vars)?;

        tracing::debug!(
            environment = %environment,
            target = %profile.target.name,
            schema = %profile.target.schema,
            keys = profile.values.len(),
            vars = profile.vars.len(),
            "Profile resolved"
        );

        Ok(profile)
    }
}

fn passthrough_vars(
    merged: &BTreeMap<String, (VarValue, Scope)>,
) -> Result<BTreeMap<String, serde_json::Value>, ConfigurationError> {
    let mut vars = BTreeMap::new();

    if let Some((value, _)) = merged.get("vars") {
        match value {
            VarValue::Json(serde_json::Value::Object(map)) => {
                for (k, v) in map {
                    vars.insert(k.clone(), v.clone());
                }
            }
            other => {
                return Err(ConfigurationError::TypeMismatch {
                    key: "vars".to_string(),
                    expected: ValueKind::Json,
                    found: other.kind(),
                })
            }
        }
    }

    for (key, (value, _)) in merged {
        if let Some(name) = key.strip_prefix(VARS_PREFIX) {
            vars.insert(name.to_string(), value.to_json());
        }
    }

    Ok(vars)
}

fn string_value(values: &BTreeMap<String, VarValue>, key: &str) -> Option<String> {
    match values.get(key) {
        Some(VarValue::String(s)) => Some(s.clone()),
        _ => None,
    }
}

fn require_string(
    values: &BTreeMap<String, VarValue>,
    key: &str,
    environment: &Environment,
) -> Result<String, ConfigurationError> {
    string_value(values, key).ok_or_else(|| ConfigurationError::MissingKey {
        key: key.to_string(),
        environment: environment.to_string(),
    })
}

fn build_profile(
    environment: &Environment,
    values: BTreeMap<String, VarValue>,
    vars: BTreeMap<String, serde_json::Value>,
) -> Result<ResolvedProfile, ConfigurationError> {
    let threads = match values.get("target.threads") {
        Some(VarValue::Integer(n)) => u32::try_from(*n)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| ConfigurationError::InvalidValue {
                key: "target.threads".to_string(),
                reason: format!("expected a positive thread count, got {}", n),
            })?,
        _ => {
            return Err(ConfigurationError::MissingKey {
                key: "target.threads".to_string(),
                environment: environment.to_string(),
            })
        }
    };

    let target = TargetProfile {
        name: require_string(&values, "target.name", environment)?,
        database: string_value(&values, "target.database"),
        schema: require_string(&values, "target.schema", environment)?,
        threads,
    };

    let credential = match values.get("target.credential") {
        Some(VarValue::Secret(handle)) => Some(handle.clone()),
        _ => None,
    };

    Ok(ResolvedProfile {
        environment: environment.clone(),
        target,
        credential,
        project_dir: string_value(&values, "dbt.project_dir"),
        profiles_dir: string_value(&values, "dbt.profiles_dir"),
        vars,
        values,
    })
}
