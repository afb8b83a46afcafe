//! Engine that replays canned event sequences.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;

use super::{Engine, EngineError, EngineEvent, EngineInvocation, EventStream};

/// What one invocation of a [`ScriptedEngine`] does.
#[derive(Debug, Clone)]
pub enum ScriptedAttempt {
    /// Emit the events, then end the stream.
    Events(Vec<EngineEvent>),
    /// Emit the events, then never produce another one.
    Hang(Vec<EngineEvent>),
    /// Fail to start.
    Fail(EngineError),
}

/// Engine whose invocations are scripted up front, one attempt per call.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    attempts: Mutex<VecDeque<ScriptedAttempt>>,
    invocations: Mutex<Vec<EngineInvocation>>,
}

impl ScriptedEngine {
    pub fn new(attempts: impl IntoIterator<Item = ScriptedAttempt>) -> Self {
        Self {
            attempts: Mutex::new(attempts.into_iter().collect()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Engine that emits `events` once and ends.
    pub fn with_events(events: Vec<EngineEvent>) -> Self {
        Self::new([ScriptedAttempt::Events(events)])
    }

    /// Invocations received so far.
    pub async fn invocations(&self) -> Vec<EngineInvocation> {
        self.invocations.lock().await.clone()
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn invoke(&self, invocation: &EngineInvocation) -> Result<EventStream, EngineError> {
        self.invocations.lock().await.push(invocation.clone());

        let attempt = self.attempts.lock().await.pop_front().ok_or_else(|| {
            EngineError::Unavailable("No scripted attempts left".to_string())
        })?;

        tracing::debug!(run_id = %invocation.run_id, "Replaying scripted engine attempt");
        match attempt {
            ScriptedAttempt::Events(events) => Ok(stream::iter(events).boxed()),
            ScriptedAttempt::Hang(events) => {
                Ok(stream::iter(events).chain(stream::pending()).boxed())
            }
            ScriptedAttempt::Fail(error) => Err(error),
        }
    }
}
