//! dbt sub-commands the runner can drive.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// dbt sub-command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbtCommand {
    #[default]
    Run,
    Build,
    Test,
    Seed,
    Snapshot,
    Compile,
    /// Install packages from `packages.yml`.
    Deps,
    /// Check the profile and warehouse connection.
    Debug,
}

impl DbtCommand {
    pub const ALL: [DbtCommand; 8] = [
        DbtCommand::Run,
        DbtCommand::Build,
        DbtCommand::Test,
        DbtCommand::Seed,
        DbtCommand::Snapshot,
        DbtCommand::Compile,
        DbtCommand::Deps,
        DbtCommand::Debug,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DbtCommand::Run => "run",
            DbtCommand::Build => "build",
            DbtCommand::Test => "test",
            DbtCommand::Seed => "seed",
            DbtCommand::Snapshot => "snapshot",
            DbtCommand::Compile => "compile",
            DbtCommand::Deps => "deps",
            DbtCommand::Debug => "debug",
        }
    }

    /// Whether the command walks the model graph. `deps` and `debug` take no
    /// selection, thread count or fail-fast flag.
    pub fn supports_selection(&self) -> bool {
        !matches!(self, DbtCommand::Deps | DbtCommand::Debug)
    }

    /// Whether dbt accepts `--full-refresh` for this command.
    pub fn supports_full_refresh(&self) -> bool {
        matches!(self, DbtCommand::Run | DbtCommand::Build | DbtCommand::Seed)
    }
}

impl std::fmt::Display for DbtCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbtCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown dbt command: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!("build".parse::<DbtCommand>().unwrap(), DbtCommand::Build);
        assert_eq!(" Seed ".parse::<DbtCommand>().unwrap(), DbtCommand::Seed);
        assert_eq!("deps".parse::<DbtCommand>().unwrap(), DbtCommand::Deps);
        assert!("docs".parse::<DbtCommand>().is_err());
    }

    #[test]
    fn test_selection_support() {
        assert!(DbtCommand::Build.supports_selection());
        assert!(!DbtCommand::Deps.supports_selection());
        assert!(!DbtCommand::Debug.supports_selection());
        assert!(!DbtCommand::Debug.supports_full_refresh());
    }

    #[test]
    fn test_full_refresh_support() {
        assert!(DbtCommand::Run.supports_full_refresh());
        assert!(!DbtCommand::Test.supports_full_refresh());
        assert!(!DbtCommand::Compile.supports_full_refresh());
    }
}
