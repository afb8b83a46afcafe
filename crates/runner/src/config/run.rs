//! Per-run options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plan::DbtCommand;

/// Options for a single orchestrated run.
///
/// Environment variables are prefixed with `FABRIC_DBT_RUN_`:
/// - `FABRIC_DBT_RUN_FAIL_FAST`: stop on the first failed node (default: false)
/// - `FABRIC_DBT_RUN_MAX_RETRIES`: whole-run retries on transient engine
///   connection failures (default: 2)
/// - `FABRIC_DBT_RUN_DRY_RUN`: build the plan only (default: false)
/// - `FABRIC_DBT_RUN_TIMEOUT_SECS`: cancel the run after this many seconds
/// - `FABRIC_DBT_RUN_RETRY_DELAY_MS`: first retry delay, doubled per attempt (default: 1000)
/// - `FABRIC_DBT_RUN_COMMAND`: dbt sub-command (default: run)
/// - `FABRIC_DBT_RUN_FULL_REFRESH`: pass `--full-refresh` (default: false)
/// - `FABRIC_DBT_RUN_EXCLUDE`: selector text for `--exclude`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub fail_fast: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Upper bound for the doubled retry delay.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    #[serde(default)]
    pub command: DbtCommand,

    #[serde(default)]
    pub full_refresh: bool,

    #[serde(default)]
    pub exclude: Option<String>,
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

impl RunConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("FABRIC_DBT_RUN_").from_env::<RunConfig>()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.retry_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_retry_delay_ms))
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            max_retries: default_max_retries(),
            dry_run: false,
            timeout_secs: None,
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            command: DbtCommand::default(),
            full_refresh: false,
            exclude: None,
        }
    }
}
