//! Translation of dbt's structured JSON log (`--log-format json`) into
//! engine events.
//!
//! Each line is a JSON object with an `info` header (`name`, `level`, `msg`,
//! `ts`) and an event-specific `data` payload. Only a handful of event names
//! matter here:
//!
//! | event                 | becomes                                   |
//! |-----------------------|-------------------------------------------|
//! | `NodeStart`           | `NodeStarted`                             |
//! | `NodeFinished`        | `NodeCompleted` with the node's status    |
//! | `SkippingDetails`     | `NodeCompleted` with status skipped       |
//! | `MainEncounteredError`| `RunFatal`                                |

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::records::NodeStatus;

use super::EngineEvent;

/// dbt exit code for a clean finish.
pub const EXIT_SUCCESS: i32 = 0;

/// dbt exit code when the command finished with failures.
pub const EXIT_FAILURE: i32 = 1;

/// dbt exit code for an internal error that aborted the invocation.
pub const EXIT_FATAL: i32 = 2;

const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "could not connect",
    "connection reset",
    "timed out",
    "timeout expired",
    "login timeout",
    "temporarily unavailable",
];

#[derive(Debug, Deserialize)]
struct LogLine {
    info: LogInfo,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct LogInfo {
    name: String,
    #[serde(default)]
    level: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    ts: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NodeInfo {
    #[serde(default)]
    node_name: String,
    #[serde(default)]
    node_status: String,
    #[serde(default)]
    node_started_at: Option<String>,
    #[serde(default)]
    node_finished_at: Option<String>,
}

/// Parse dbt timestamps, which come with or without an offset.
fn parse_ts(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .map(|naive| naive.and_utc())
}

fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Stateful line-by-line translator for one dbt invocation.
#[derive(Debug, Default)]
pub struct DbtLogTranslator {
    any_node_started: bool,
    transient_hint: bool,
    fatal_reported: bool,
    completed: HashSet<String>,
    last_error: Option<String>,
}

impl DbtLogTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one output line. Plain-text lines yield nothing but still
    /// feed the error and connection heuristics.
    pub fn push_line(&mut self, line: &str) -> Option<EngineEvent> {
        let parsed: LogLine = match serde_json::from_str(line.trim()) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.observe_text(line);
                return None;
            }
        };

        if parsed.info.level.eq_ignore_ascii_case("error") {
            self.observe_text(&parsed.info.msg);
            if !parsed.info.msg.is_empty() {
                self.last_error = Some(parsed.info.msg.clone());
            }
        }

        let event_ts = parse_ts(parsed.info.ts.as_deref()).unwrap_or_else(Utc::now);
        let node: NodeInfo = parsed
            .data
            .get("node_info")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        match parsed.info.name.as_str() {
            "NodeStart" if !node.node_name.is_empty() => {
                self.any_node_started = true;
                Some(EngineEvent::NodeStarted {
                    model: node.node_name,
                    at: parse_ts(node.node_started_at.as_deref()).unwrap_or(event_ts),
                })
            }
            "NodeFinished" if !node.node_name.is_empty() => {
                let status = NodeStatus::from(node.node_status.as_str());
                let run_result = parsed.data.get("run_result");
                let rows = run_result
                    .and_then(|r| r.pointer("/adapter_response/rows_affected"))
                    .and_then(|v| v.as_i64());
                let error = match status {
                    NodeStatus::Failed => run_result
                        .and_then(|r| r.get("message"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .or_else(|| Some(parsed.info.msg.clone())),
                    _ => None,
                };
                self.complete(
                    node.node_name,
                    status,
                    rows,
                    error,
                    parse_ts(node.node_started_at.as_deref()),
                    parse_ts(node.node_finished_at.as_deref()).unwrap_or(event_ts),
                )
            }
            "SkippingDetails" => {
                let name = if node.node_name.is_empty() {
                    parsed
                        .data
                        .get("node_name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string()
                } else {
                    node.node_name
                };
                if name.is_empty() {
                    return None;
                }
                self.complete(name, NodeStatus::Skipped, None, None, None, event_ts)
            }
            "MainEncounteredError" => {
                let message = parsed
                    .data
                    .get("exc")
                    .and_then(|v| v.as_str())
                    .unwrap_or(parsed.info.msg.as_str())
                    .to_string();
                self.observe_text(&message);
                Some(self.fatal(message))
            }
            _ => None,
        }
    }

    /// Event implied by the process exit, if any.
    ///
    /// [`EXIT_SUCCESS`] is a clean finish and [`EXIT_FAILURE`] after at
    /// least one completed node is a run whose failures were already
    /// reported. [`EXIT_FAILURE`] with no node reported (a failing `debug`
    /// or `deps`), [`EXIT_FATAL`], any other code and death by signal are
    /// fatal.
    pub fn finish(&mut self, exit_code: Option<i32>) -> Option<EngineEvent> {
        if self.fatal_reported {
            return None;
        }
        let fallback = match exit_code {
            Some(EXIT_SUCCESS) => return None,
            Some(EXIT_FAILURE) if !self.completed.is_empty() => return None,
            Some(EXIT_FAILURE) => "dbt failed before reporting any node".to_string(),
            Some(EXIT_FATAL) => "dbt aborted with an internal error".to_string(),
            Some(code) => format!("dbt exited with status {}", code),
            None => "dbt was terminated by a signal".to_string(),
        };
        let message = self.last_error.clone().unwrap_or(fallback);
        Some(self.fatal(message))
    }

    fn observe_text(&mut self, text: &str) {
        if !self.any_node_started && is_transient_message(text) {
            self.transient_hint = true;
        }
    }

    fn fatal(&mut self, message: String) -> EngineEvent {
        self.fatal_reported = true;
        EngineEvent::RunFatal {
            message,
            transient: self.transient_hint && !self.any_node_started,
        }
    }

    fn complete(
        &mut self,
        model: String,
        status: NodeStatus,
        rows: Option<i64>,
        error: Option<String>,
        started_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Option<EngineEvent> {
        // dbt may report a skipped node through more than one event
        if !self.completed.insert(model.clone()) {
            return None;
        }
        Some(EngineEvent::NodeCompleted {
            model,
            status,
            rows,
            error,
            started_at,
            at,
        })
    }
}
