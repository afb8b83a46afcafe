//! OTAP environments.
//!
//! A run always targets exactly one stage of the
//! development/test/acceptance/production ladder inside one workspace.

use serde::{Deserialize, Serialize};

use crate::variables::ConfigurationError;

/// Stage of the OTAP ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtapStage {
    Development,
    Test,
    Acceptance,
    Production,
}

impl OtapStage {
    /// All stages, least to most protected.
    pub const ALL: [OtapStage; 4] = [
        OtapStage::Development,
        OtapStage::Test,
        OtapStage::Acceptance,
        OtapStage::Production,
    ];

    /// Short identifier used in variable libraries and on the command line.
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Development => "dev",
            Self::Test => "test",
            Self::Acceptance => "acc",
            Self::Production => "prod",
        }
    }
}

impl std::fmt::Display for OtapStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

impl std::str::FromStr for OtapStage {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dev" | "development" | "o" => Ok(Self::Development),
            "test" | "t" => Ok(Self::Test),
            "acc" | "acceptance" | "a" => Ok(Self::Acceptance),
            "prod" | "production" | "p" => Ok(Self::Production),
            other => Err(ConfigurationError::UnknownEnvironment(other.to_string())),
        }
    }
}

/// Target environment of one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Environment {
    pub stage: OtapStage,
    pub workspace: String,
}

impl Environment {
    pub fn new(stage: OtapStage, workspace: impl Into<String>) -> Self {
        Self {
            stage,
            workspace: workspace.into(),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.stage, self.workspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_from_str() {
        assert_eq!("prod".parse::<OtapStage>().unwrap(), OtapStage::Production);
        assert_eq!("Acceptance".parse::<OtapStage>().unwrap(), OtapStage::Acceptance);
        assert_eq!("DEV".parse::<OtapStage>().unwrap(), OtapStage::Development);
        assert!("staging".parse::<OtapStage>().is_err());
    }

    #[test]
    fn test_environment_display() {
        let env = Environment::new(OtapStage::Test, "sales");
        assert_eq!(env.to_string(), "test@sales");
    }
}
