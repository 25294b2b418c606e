//! In-memory fakes for the external interfaces (testing only).
//!
//! Provides `ScriptedBackend`, `MemoryExecutor` and `MemorySink` that satisfy
//! the trait contracts without network, disk or processes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{Completion, CompletionRequest, LlmBackend, TokenUsage};
use crate::domain::{BackendError, ExecutorError};
use crate::executor::{validate_relative_path, CommandOutput, ProjectExecutor};
use crate::sink::{LogRecord, LogSink, SinkError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// ScriptedBackend
// ---------------------------------------------------------------------------

type Responder = Arc<dyn Fn(&CompletionRequest) -> Result<String, BackendError> + Send + Sync>;

/// Backend that replays queued replies, then falls back to a responder.
///
/// The default responder understands the built-in agents' prompts: it returns
/// a two-file plan, file contents, or a passing assessment.
pub struct ScriptedBackend {
    queue: Mutex<VecDeque<Result<(String, Option<f64>), BackendError>>>,
    responder: Responder,
    cost_per_call: f64,
    delay: Duration,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            responder: Arc::new(|req| Ok(default_reply(req))),
            cost_per_call: 0.0,
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply for the next call.
    pub fn reply(self, text: impl Into<String>) -> Self {
        lock(&self.queue).push_back(Ok((text.into(), None)));
        self
    }

    /// Queue a reply that costs `cost_usd` instead of the per-call cost.
    pub fn reply_costing(self, text: impl Into<String>, cost_usd: f64) -> Self {
        lock(&self.queue).push_back(Ok((text.into(), Some(cost_usd))));
        self
    }

    /// Queue a failure for the next call.
    pub fn fail(self, err: BackendError) -> Self {
        lock(&self.queue).push_back(Err(err));
        self
    }

    pub fn with_responder(
        mut self,
        responder: impl Fn(&CompletionRequest) -> Result<String, BackendError> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Arc::new(responder);
        self
    }

    /// Cost charged for every successful call.
    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_per_call = cost_usd;
        self
    }

    /// Simulated latency of every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, BackendError> {
        lock(&self.requests).push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = lock(&self.queue).pop_front();
        let (text, cost) = match scripted {
            Some(reply) => reply?,
            None => ((self.responder)(request)?, None),
        };
        Ok(Completion {
            usage: TokenUsage {
                prompt_tokens: (request.prompt.len() / 4) as u64,
                completion_tokens: (text.len() / 4) as u64,
            },
            text,
            cost_usd: cost.unwrap_or(self.cost_per_call),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Reply understood by the built-in agents.
pub fn default_reply(request: &CompletionRequest) -> String {
    if request.prompt.contains("JSON array") {
        r#"[{"file_path": "src/main.py", "description": "entry point"},
            {"file_path": "README.md", "description": "usage"}]"#
            .to_string()
    } else if request.prompt.contains("JSON object") {
        r#"{"passed": true, "coverage": 95.0, "critical_issues": 0, "detail": "looks good"}"#
            .to_string()
    } else {
        format!("# generated for {}\n", request.model)
    }
}

// ---------------------------------------------------------------------------
// MemoryExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ScriptedCommand {
    output: CommandOutput,
    delay: Duration,
}

/// Executor backed by a `HashMap<path, content>` with scripted commands.
///
/// Unscripted commands succeed with empty output.
#[derive(Debug, Default)]
pub struct MemoryExecutor {
    files: Mutex<HashMap<String, String>>,
    commands: Mutex<HashMap<String, ScriptedCommand>>,
    history: Mutex<Vec<String>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command(self, command: impl Into<String>, output: CommandOutput) -> Self {
        self.with_slow_command(command, output, Duration::ZERO)
    }

    /// Script a command that takes `delay` before returning `output`.
    pub fn with_slow_command(
        self,
        command: impl Into<String>,
        output: CommandOutput,
        delay: Duration,
    ) -> Self {
        lock(&self.commands).insert(command.into(), ScriptedCommand { output, delay });
        self
    }

    pub fn file(&self, path: &str) -> Option<String> {
        lock(&self.files).get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = lock(&self.files).keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Commands run so far, in order.
    pub fn commands_run(&self) -> Vec<String> {
        lock(&self.history).clone()
    }
}

#[async_trait]
impl ProjectExecutor for MemoryExecutor {
    async fn write_file(&self, path: &str, content: &str) -> Result<(), ExecutorError> {
        let clean = validate_relative_path(path)?;
        lock(&self.files).insert(clean.to_string_lossy().into_owned(), content.to_string());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, ExecutorError> {
        let clean = validate_relative_path(path)?;
        lock(&self.files)
            .get(clean.to_string_lossy().as_ref())
            .cloned()
            .ok_or_else(|| ExecutorError::Io(format!("{path}: no such file")))
    }

    async fn run_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecutorError> {
        lock(&self.history).push(command.to_string());
        let scripted = lock(&self.commands).get(command).cloned();
        let Some(scripted) = scripted else {
            return Ok(CommandOutput::default());
        };
        if scripted.delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(ExecutorError::Timeout {
                command: command.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
        tokio::time::sleep(scripted.delay).await;
        Ok(scripted.output)
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Sink that keeps every record it receives.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
    flushed: Mutex<bool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        lock(&self.records).clone()
    }

    /// Event types in delivery order.
    pub fn event_types(&self) -> Vec<String> {
        lock(&self.records)
            .iter()
            .map(|r| r.event_type.clone())
            .collect()
    }

    pub fn was_flushed(&self) -> bool {
        *lock(&self.flushed)
    }
}

#[async_trait]
impl LogSink for MemorySink {
    async fn write(&self, record: &LogRecord) -> Result<(), SinkError> {
        lock(&self.records).push(record.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        *lock(&self.flushed) = true;
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
