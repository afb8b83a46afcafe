//! Hierarchical variable library and profile resolution.
//!
//! - **Types**: scope layers and typed values
//! - **Store**: in-memory, YAML file and environment-variable sources
//! - **Resolver**: merges global → stage → workspace into a [`ResolvedProfile`]

mod resolver;
mod store;
mod types;

use thiserror::Error;

pub use resolver::{merge_layers, ResolvedProfile, TargetProfile, VariableResolver, VARS_PREFIX};
pub use store::{EnvVariableStore, InMemoryVariableStore, VariableStore, YamlVariableLibrary};
pub use types::{
    CredentialRef, KeySpec, Scope, ScopeLayer, ValueKind, VarValue, SECRET_SCHEME,
};

/// Errors raised while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A required key has no value after the full override chain.
    #[error("Missing required key '{key}' for environment {environment}")]
    MissingKey { key: String, environment: String },

    /// A value's declared type differs from the expected one.
    #[error("Type mismatch for '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: ValueKind,
        found: ValueKind,
    },

    /// A value has the right type but an unusable content.
    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// Unrecognized OTAP stage.
    #[error("Unknown environment: {0}")]
    UnknownEnvironment(String),

    /// The variable source could not be read or parsed.
    #[error("Variable source error: {0}")]
    Source(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigurationError::MissingKey {
            key: "target.schema".to_string(),
            environment: "prod@sales".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Missing required key 'target.schema' for environment prod@sales"
        );

        let err = ConfigurationError::TypeMismatch {
            key: "target.threads".to_string(),
            expected: ValueKind::Integer,
            found: ValueKind::String,
        };
        assert_eq!(
            err.to_string(),
            "Type mismatch for 'target.threads': expected integer, found string"
        );
    }
}
