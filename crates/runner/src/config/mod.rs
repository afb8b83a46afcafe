//! Configuration for the runner.
//!
//! All settings are loaded from environment variables with `envy`:
//! - [`RunConfig`]: per-run options, `FABRIC_DBT_RUN_*`
//! - [`RunnerSettings`]: process-level settings, `FABRIC_DBT_*`
//! - [`LakehouseConfig`]: lakehouse location, `FABRIC_LAKEHOUSE_*`

mod lakehouse;
mod run;
mod settings;

pub use lakehouse::{LakehouseConfig, LakehouseInfo};
pub use run::RunConfig;
pub use settings::RunnerSettings;
