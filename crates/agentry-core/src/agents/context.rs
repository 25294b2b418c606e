//! Everything an agent may touch: bus, inbox, backend and executor.
//!
//! Every externally visible side effect goes through [`AgentContext`], which
//! drains the inbox first so a cancellation or pause is honoured before the
//! effect happens.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::AgentError;
use crate::backend::{complete_with_retry, Completion, CompletionRequest, LlmBackend, RetryPolicy};
use crate::budget::{Headroom, Usage};
use crate::bus::EventBus;
use crate::domain::{content_digest, kinds, AgentSpec, ArtifactFile, EngineError, Event};
use crate::executor::{CommandOutput, ProjectExecutor};
use crate::lifecycle::{Control, Inbox};

/// Per-agent handle to the run.
pub struct AgentContext {
    agent_id: String,
    run_id: Uuid,
    spec: AgentSpec,
    bus: Arc<EventBus>,
    inbox: Inbox,
    backend: Arc<dyn LlmBackend>,
    executor: Arc<dyn ProjectExecutor>,
    retry: RetryPolicy,
    paused: bool,
    messages: Vec<Event>,
    last_headroom: Option<Headroom>,
}

impl AgentContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: String,
        spec: AgentSpec,
        bus: Arc<EventBus>,
        inbox: Inbox,
        backend: Arc<dyn LlmBackend>,
        executor: Arc<dyn ProjectExecutor>,
    ) -> Self {
        let retry = RetryPolicy::new(spec.max_retries);
        Self {
            agent_id,
            run_id: bus.run_id(),
            spec,
            bus,
            inbox,
            backend,
            executor,
            retry,
            paused: false,
            messages: Vec::new(),
            last_headroom: None,
        }
    }

    /// Override the retry policy (tests use a zero base delay).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    pub fn last_headroom(&self) -> Option<Headroom> {
        self.last_headroom
    }

    /// Publish an event on behalf of this agent once pending controls are applied.
    pub async fn publish(
        &mut self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<u64, AgentError> {
        self.checkpoint().await?;
        self.send_event(event_type, payload).await
    }

    async fn send_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<u64, AgentError> {
        let event = Event::new(self.run_id, event_type, payload).with_agent(&self.agent_id);
        Ok(self.bus.publish(event).await?)
    }

    /// Apply pending control messages. Blocks while paused; fails once cancelled.
    pub async fn checkpoint(&mut self) -> Result<(), AgentError> {
        while let Some(control) = self.inbox.try_recv() {
            self.apply(control)?;
        }
        while self.paused {
            debug!(agent_id = %self.agent_id, "paused, waiting for resume");
            match self.inbox.recv().await {
                Some(control) => self.apply(control)?,
                None => return Err(AgentError::Cancelled),
            }
        }
        if self.inbox.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    fn apply(&mut self, control: Control) -> Result<(), AgentError> {
        match control {
            Control::Cancel => return Err(AgentError::Cancelled),
            Control::Pause => self.paused = true,
            Control::Resume => self.paused = false,
            Control::Deliver(event) => self.messages.push(event),
            // Receipts are awaited in `report_usage`; anything here is stale.
            Control::Receipt(_) => {}
        }
        Ok(())
    }

    /// Messages routed to this agent since the last call.
    pub fn take_messages(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.messages)
    }

    /// Report usage and wait for the accounting receipt.
    pub async fn report_usage(&mut self, usage: Usage) -> Result<Headroom, AgentError> {
        self.send_event(kinds::AGENT_USAGE, json!(usage)).await?;
        loop {
            match self.inbox.recv().await {
                Some(Control::Receipt(headroom)) => {
                    self.last_headroom = Some(headroom);
                    if headroom.exhausted() {
                        return Err(AgentError::BudgetExhausted);
                    }
                    return Ok(headroom);
                }
                Some(control) => self.apply(control)?,
                None => return Err(AgentError::Cancelled),
            }
        }
    }

    /// One LLM call with retries; its cost and duration are accounted.
    #[instrument(skip(self, prompt, system), fields(agent_id = %self.agent_id))]
    pub async fn complete(
        &mut self,
        prompt: String,
        system: Option<String>,
    ) -> Result<Completion, AgentError> {
        self.checkpoint().await?;
        let request = CompletionRequest {
            model: self.spec.model.clone(),
            system,
            prompt,
            temperature: self.spec.temperature,
            max_tokens: self.spec.max_tokens,
        };

        let started = Instant::now();
        let backend = self.backend.clone();
        let retry = self.retry;
        let result = tokio::select! {
            result = complete_with_retry(backend.as_ref(), &request, retry) => result,
            _ = self.inbox.cancelled() => return Err(AgentError::Cancelled),
        };
        let elapsed_secs = started.elapsed().as_secs_f64();

        match result {
            Ok(completion) => {
                self.report_usage(Usage {
                    cost_usd: completion.cost_usd,
                    elapsed_secs,
                    prompt_tokens: completion.usage.prompt_tokens,
                    completion_tokens: completion.usage.completion_tokens,
                })
                .await?;
                Ok(completion)
            }
            Err(err) => {
                self.report_usage(Usage::elapsed(elapsed_secs)).await?;
                Err(EngineError::Backend(err).into())
            }
        }
    }

    /// Write a project file and return its artifact entry.
    pub async fn write_file(&mut self, path: &str, content: &str) -> Result<ArtifactFile, AgentError> {
        self.checkpoint().await?;
        self.executor
            .write_file(path, content)
            .await
            .map_err(EngineError::from)?;
        Ok(ArtifactFile {
            path: path.to_string(),
            digest: content_digest(content.as_bytes()),
        })
    }

    pub async fn read_file(&mut self, path: &str) -> Result<String, AgentError> {
        self.checkpoint().await?;
        Ok(self
            .executor
            .read_file(path)
            .await
            .map_err(EngineError::from)?)
    }

    /// Run a command; its duration is accounted as agent time.
    pub async fn run_command(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, AgentError> {
        self.checkpoint().await?;
        let started = Instant::now();
        let executor = self.executor.clone();
        let result = tokio::select! {
            result = executor.run_command(command, timeout) => result,
            _ = self.inbox.cancelled() => return Err(AgentError::Cancelled),
        };
        self.report_usage(Usage::elapsed(started.elapsed().as_secs_f64()))
            .await?;
        Ok(result.map_err(EngineError::from)?)
    }
}
