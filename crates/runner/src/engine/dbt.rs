//! dbt command line engine.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::records::NodeStatus;
use crate::sanitize::sanitize_env_pairs;
use crate::run_log::{RunLog, DEFAULT_FLUSH_EVERY};

use super::dbt_log::DbtLogTranslator;
use super::{Engine, EngineError, EngineEvent, EngineInvocation, EventStream};

const CHANNEL_CAPACITY: usize = 256;

/// Runs the dbt executable and streams its structured log as events.
#[derive(Debug, Clone)]
pub struct DbtCliEngine {
    executable: String,
    logs_dir: Option<PathBuf>,
    flush_every: usize,
}

impl DbtCliEngine {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            logs_dir: None,
            flush_every: DEFAULT_FLUSH_EVERY,
        }
    }

    /// Write a run log per invocation under `dir`.
    pub fn with_logs_dir(mut self, dir: impl Into<PathBuf>, flush_every: usize) -> Self {
        self.logs_dir = Some(dir.into());
        self.flush_every = flush_every;
        self
    }

    fn run_log(&self, invocation: &EngineInvocation) -> RunLog {
        match &self.logs_dir {
            Some(dir) => RunLog::for_run(dir, invocation.run_id, self.flush_every),
            None => RunLog::in_memory(),
        }
    }
}

impl Default for DbtCliEngine {
    fn default() -> Self {
        Self::new("dbt")
    }
}

/// Forward every line of `reader` into `lines`.
fn spawn_line_reader<R>(reader: R, lines: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if lines.send(line).await.is_err() {
                break;
            }
        }
    });
}

/// Pump engine output into `events` until the process exits or the
/// receiver goes away.
async fn pump(
    mut child: Child,
    mut lines: mpsc::Receiver<String>,
    events: mpsc::Sender<EngineEvent>,
    mut log: RunLog,
) {
    let mut translator = DbtLogTranslator::new();
    let mut failed = false;

    loop {
        tokio::select! {
            _ = events.closed() => {
                tracing::info!("Event consumer gone, stopping dbt");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "Failed to stop dbt process");
                }
                log.error("Run cancelled").await;
                log.finish(false).await;
                return;
            }
            line = lines.recv() => {
                let Some(line) = line else { break };
                log.engine_line(&line).await;
                if let Some(event) = translator.push_line(&line) {
                    if matches!(
                        event,
                        EngineEvent::RunFatal { .. }
                            | EngineEvent::NodeCompleted { status: NodeStatus::Failed, .. }
                    ) {
                        failed = true;
                    }
                    if events.send(event).await.is_err() {
                        let _ = child.start_kill();
                        log.finish(false).await;
                        return;
                    }
                }
            }
        }
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to wait for dbt process");
            None
        }
    };
    if exit_code != Some(0) {
        failed = true;
        log.error(&match exit_code {
            Some(code) => format!("dbt exited with return code {}", code),
            None => "dbt exited without a return code".to_string(),
        })
        .await;
    }

    if let Some(event) = translator.finish(exit_code) {
        let _ = events.send(event).await;
    }
    log.finish(!failed).await;
}

#[async_trait]
impl Engine for DbtCliEngine {
    async fn invoke(&self, invocation: &EngineInvocation) -> Result<EventStream, EngineError> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }

        tracing::info!(
            run_id = %invocation.run_id,
            executable = %self.executable,
            target = %invocation.target,
            select = invocation.select.as_deref().unwrap_or("*"),
            "Starting dbt"
        );
        tracing::debug!(
            run_id = %invocation.run_id,
            env = ?sanitize_env_pairs(&invocation.env),
            "dbt environment"
        );

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::Unavailable(format!("Failed to spawn {}: {}", self.executable, e))
        })?;

        let mut log = self.run_log(invocation);
        log.info(&format!("Starting dbt {}", invocation.args.join(" "))).await;

        let (line_tx, line_rx) = mpsc::channel(CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, line_tx.clone());
        }
        drop(line_tx);

        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(pump(child, line_rx, event_tx, log));

        Ok(ReceiverStream::new(event_rx).boxed())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn invocation(args: Vec<&str>) -> EngineInvocation {
        EngineInvocation {
            run_id: Uuid::new_v4(),
            target: "fabric".to_string(),
            select: None,
            args: args.into_iter().map(str::to_string).collect(),
            env: vec![("DBT_TARGET_SCHEMA".to_string(), "analytics".to_string())],
            working_dir: None,
        }
    }

    #[tokio::test]
    async fn test_missing_executable_is_unavailable() {
        let engine = DbtCliEngine::new("/nonexistent/dbt-binary");
        let result = engine.invoke(&invocation(vec!["run"])).await;
        assert!(matches!(result, Err(EngineError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_streams_json_log_lines() {
        let script = r#"
echo '{"info":{"name":"NodeStart","level":"info","msg":""},"data":{"node_info":{"node_name":"model_a"}}}'
echo 'plain text line'
echo '{"info":{"name":"NodeFinished","level":"error","msg":"boom"},"data":{"node_info":{"node_name":"model_a","node_status":"error"},"run_result":{"message":"Database Error in model_a"}}}'
echo '{"info":{"name":"SkippingDetails","level":"info","msg":""},"data":{"node_info":{"node_name":"model_b"}}}'
exit 1
"#;
        let dir = tempfile::tempdir().unwrap();
        let engine = DbtCliEngine::new("sh").with_logs_dir(dir.path(), 1);
        let inv = invocation(vec!["-c", script]);
        let events: Vec<EngineEvent> = engine.invoke(&inv).await.unwrap().collect().await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], EngineEvent::NodeStarted { model, .. } if model == "model_a"));
        assert!(matches!(
            &events[1],
            EngineEvent::NodeCompleted { status: NodeStatus::Failed, error: Some(e), .. }
                if e.contains("Database Error")
        ));
        assert!(matches!(
            &events[2],
            EngineEvent::NodeCompleted { status: NodeStatus::Skipped, .. }
        ));

        let log_path = dir.path().join(format!("{}.log", inv.run_id));
        let written = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(written.contains("plain text line"));
        assert!(written.contains("Failure type: DATABASE"));
    }

    #[tokio::test]
    async fn test_exit_two_is_fatal() {
        let engine = DbtCliEngine::new("sh");
        let events: Vec<EngineEvent> = engine
            .invoke(&invocation(vec!["-c", "echo 'Connection refused'; exit 2"]))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], EngineEvent::RunFatal { transient: true, .. }));
    }

    #[tokio::test]
    async fn test_failing_debug_without_nodes_is_fatal() {
        let engine = DbtCliEngine::new("sh");
        let events: Vec<EngineEvent> = engine
            .invoke(&invocation(vec!["-c", "echo 'Connection test: [ERROR]'; exit 1"]))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], EngineEvent::RunFatal { transient: false, .. }));
    }
}
