//! Human-readable run log written to the lakehouse `Files/` area.
//!
//! Lines are buffered and the whole accumulated log is rewritten every
//! `flush_every` lines, so a partially finished run still leaves a readable
//! file behind. Write failures are reported through tracing and never fail
//! the run.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Local;
use uuid::Uuid;

/// Default number of lines buffered between flushes.
pub const DEFAULT_FLUSH_EVERY: usize = 25;

const SEPARATOR_WIDTH: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Coarse classification of why a dbt run failed, taken from its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Compilation,
    Database,
    Runtime,
    TestFailure,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compilation => write!(f, "COMPILATION"),
            Self::Database => write!(f, "DATABASE"),
            Self::Runtime => write!(f, "RUNTIME"),
            Self::TestFailure => write!(f, "TEST_FAILURE"),
        }
    }
}

/// Classify one line of dbt output.
pub fn classify_failure(line: &str) -> Option<FailureKind> {
    if line.contains("Compilation Error") {
        Some(FailureKind::Compilation)
    } else if line.contains("Database Error") {
        Some(FailureKind::Database)
    } else if line.contains("Runtime Error") {
        Some(FailureKind::Runtime)
    } else if line.contains("FAIL") {
        Some(FailureKind::TestFailure)
    } else {
        None
    }
}

/// Buffered, periodically flushed log of one run.
#[derive(Debug)]
pub struct RunLog {
    path: Option<PathBuf>,
    flush_every: usize,
    persisted: String,
    buffer: Vec<String>,
    failure: Option<FailureKind>,
    started: Instant,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>, flush_every: usize) -> Self {
        Self {
            path: Some(path.into()),
            flush_every: flush_every.max(1),
            persisted: String::new(),
            buffer: Vec::new(),
            failure: None,
            started: Instant::now(),
        }
    }

    /// Log kept in memory only.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            ..Self::new(PathBuf::new(), DEFAULT_FLUSH_EVERY)
        }
    }

    /// `<logs_dir>/<run_id>.log`
    pub fn for_run(logs_dir: &Path, run_id: Uuid, flush_every: usize) -> Self {
        Self::new(logs_dir.join(format!("{}.log", run_id)), flush_every)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// First classified failure seen so far.
    pub fn failure(&self) -> Option<FailureKind> {
        self.failure
    }

    pub async fn log(&mut self, level: LogLevel, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        self.buffer.push(format!("[{}] [{}] {}\n", timestamp, level, message));
        if self.buffer.len() >= self.flush_every {
            self.flush().await;
        }
    }

    pub async fn info(&mut self, message: &str) {
        self.log(LogLevel::Info, message).await;
    }

    pub async fn error(&mut self, message: &str) {
        self.log(LogLevel::Error, message).await;
    }

    /// Log a raw line of engine output and classify it.
    pub async fn engine_line(&mut self, line: &str) {
        if self.failure.is_none() {
            self.failure = classify_failure(line);
        }
        self.info(line).await;
    }

    /// Rewrite the log file with everything logged so far.
    pub async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        for line in self.buffer.drain(..) {
            self.persisted.push_str(&line);
        }

        let Some(path) = &self.path else {
            return;
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(path = %parent.display(), error = %e, "Failed to create run log directory");
                return;
            }
        }
        if let Err(e) = tokio::fs::write(path, &self.persisted).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to flush run log");
        }
    }

    /// Write the closing footer and flush.
    pub async fn finish(&mut self, success: bool) {
        let duration = self.started.elapsed().as_secs_f64();
        let separator = "=".repeat(SEPARATOR_WIDTH);

        self.info("").await;
        self.info(&separator).await;
        self.info("DBT Run Finished").await;
        self.info(&format!("Success: {}", success)).await;
        self.info(&format!("Duration: {:.1}s", duration)).await;
        if let Some(failure) = self.failure {
            self.error(&format!("Failure type: {}", failure)).await;
        }
        self.info(&separator).await;
        self.flush().await;
    }

    /// Everything logged so far, including unflushed lines.
    pub fn contents(&self) -> String {
        let mut out = self.persisted.clone();
        for line in &self.buffer {
            out.push_str(line);
        }
        out
    }
}
