//! Variable library data types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::environment::OtapStage;

/// Prefix that marks a bare string value as a credential handle.
pub const SECRET_SCHEME: &str = "secret://";

/// Primitive type declared for a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Integer,
    Boolean,
    Number,
    Secret,
    Json,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueKind::String => "string",
            ValueKind::Integer => "integer",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::Secret => "secret",
            ValueKind::Json => "json",
        };
        write!(f, "{}", s)
    }
}

/// Opaque reference to a credential held by the host (key vault, connection).
///
/// The referenced secret is never read by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(String);

impl CredentialRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// The handle string, e.g. `secret://kv-sales/dbt-sp`.
    pub fn handle(&self) -> &str {
        &self.0
    }
}

/// Typed variable value as declared in the library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum VarValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Number(f64),
    Secret(CredentialRef),
    Json(serde_json::Value),
}

impl VarValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            VarValue::String(_) => ValueKind::String,
            VarValue::Integer(_) => ValueKind::Integer,
            VarValue::Boolean(_) => ValueKind::Boolean,
            VarValue::Number(_) => ValueKind::Number,
            VarValue::Secret(_) => ValueKind::Secret,
            VarValue::Json(_) => ValueKind::Json,
        }
    }

    /// Infer a typed value from an untyped JSON scalar.
    pub fn infer(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Self::infer_str(&s),
            serde_json::Value::Bool(b) => VarValue::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => VarValue::Integer(i),
                None => VarValue::Number(n.as_f64().unwrap_or_default()),
            },
            other => VarValue::Json(other),
        }
    }

    /// Infer a typed value from a plain string (environment variables).
    pub fn infer_str(s: &str) -> Self {
        if s.starts_with(SECRET_SCHEME) {
            return VarValue::Secret(CredentialRef::new(s));
        }
        if let Ok(i) = s.parse::<i64>() {
            return VarValue::Integer(i);
        }
        match s {
            "true" | "True" | "TRUE" => VarValue::Boolean(true),
            "false" | "False" | "FALSE" => VarValue::Boolean(false),
            _ => VarValue::String(s.to_string()),
        }
    }

    /// JSON form handed to the engine as a passthrough variable.
    ///
    /// Secrets are rendered as their handle, never dereferenced.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            VarValue::String(s) => serde_json::json!(s),
            VarValue::Integer(i) => serde_json::json!(i),
            VarValue::Boolean(b) => serde_json::json!(b),
            VarValue::Number(n) => serde_json::json!(n),
            VarValue::Secret(r) => serde_json::json!(r.handle()),
            VarValue::Json(v) => v.clone(),
        }
    }
}

/// Entry as written in a variable library file: typed or bare.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawValue {
    Typed(VarValue),
    Bare(serde_json::Value),
}

impl From<RawValue> for VarValue {
    fn from(raw: RawValue) -> Self {
        match raw {
            RawValue::Typed(v) => v,
            RawValue::Bare(v) => VarValue::infer(v),
        }
    }
}

/// Scope a layer of variables applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "name", rename_all = "snake_case")]
pub enum Scope {
    Global,
    Stage(OtapStage),
    Workspace(String),
}

impl Scope {
    /// Precedence rank; higher ranks override lower ones.
    pub fn rank(&self) -> u8 {
        match self {
            Scope::Global => 0,
            Scope::Stage(_) => 1,
            Scope::Workspace(_) => 2,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Stage(stage) => write!(f, "stage:{}", stage),
            Scope::Workspace(ws) => write!(f, "workspace:{}", ws),
        }
    }
}

/// One layer of the hierarchy: every key defined at a single scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeLayer {
    pub scope: Scope,
    pub entries: BTreeMap<String, VarValue>,
}

impl ScopeLayer {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            entries: BTreeMap::new(),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: VarValue) -> Self {
        self.entries.insert(key.into(), value);
        self
    }
}

/// A key the caller needs resolved, with its expected type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub key: String,
    pub kind: ValueKind,
    pub required: bool,
}

impl KeySpec {
    pub fn required(key: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            key: key.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(key: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            key: key.into(),
            kind,
            required: false,
        }
    }

    /// Keys a dbt profile needs from the variable library.
    pub fn dbt_profile() -> Vec<KeySpec> {
        vec![
            KeySpec::required("target.name", ValueKind::String),
            KeySpec::optional("target.database", ValueKind::String),
            KeySpec::required("target.schema", ValueKind::String),
            KeySpec::required("target.threads", ValueKind::Integer),
            KeySpec::optional("target.credential", ValueKind::Secret),
            KeySpec::optional("dbt.project_dir", ValueKind::String),
            KeySpec::optional("dbt.profiles_dir", ValueKind::String),
        ]
    }

    /// Whether a value of `found` satisfies this key.
    pub fn accepts(&self, found: ValueKind) -> bool {
        found == self.kind || (self.kind == ValueKind::Number && found == ValueKind::Integer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_str() {
        assert_eq!(VarValue::infer_str("8"), VarValue::Integer(8));
        assert_eq!(VarValue::infer_str("true"), VarValue::Boolean(true));
        assert_eq!(
            VarValue::infer_str("secret://kv/dbt"),
            VarValue::Secret(CredentialRef::new("secret://kv/dbt"))
        );
        assert_eq!(
            VarValue::infer_str("analytics"),
            VarValue::String("analytics".to_string())
        );
    }

    #[test]
    fn test_raw_value_typed_and_bare() {
        let typed: RawValue =
            serde_json::from_value(serde_json::json!({"type": "integer", "value": 4})).unwrap();
        assert_eq!(VarValue::from(typed), VarValue::Integer(4));

        let bare: RawValue = serde_json::from_value(serde_json::json!("silver")).unwrap();
        assert_eq!(VarValue::from(bare), VarValue::String("silver".to_string()));
    }

    #[test]
    fn test_number_accepts_integer() {
        let spec = KeySpec::required("ratio", ValueKind::Number);
        assert!(spec.accepts(ValueKind::Integer));
        assert!(!KeySpec::required("n", ValueKind::Integer).accepts(ValueKind::Number));
    }
}
