//! Engine error taxonomy.
//!
//! Only [`EngineError::Specification`] and a run-scoped
//! [`EngineError::BudgetExceeded`] end a run. Everything else is contained to
//! the agent or verifier that produced it and surfaces as a bus event.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::agent::AgentState;

/// Which budget scope was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// A single agent's budget slice.
    Agent,
    /// The run-level aggregate.
    Run,
}

/// Which budget dimension was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Cost,
    Time,
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetScope::Agent => write!(f, "agent"),
            BudgetScope::Run => write!(f, "run"),
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Cost => write!(f, "cost"),
            LimitKind::Time => write!(f, "time"),
        }
    }
}

/// Errors produced by the LLM backend interface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Request(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("backend response could not be decoded: {0}")]
    Decode(String),

    #[error("backend is not configured: {0}")]
    NotConfigured(String),
}

impl BackendError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Request(_) => true,
            BackendError::Status { status, .. } => *status == 429 || *status >= 500,
            BackendError::Decode(_) | BackendError::NotConfigured(_) => false,
        }
    }
}

/// Errors produced by the project executor interface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    #[error("path rejected by executor: {0}")]
    PathRejected(String),

    #[error("command {command:?} timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("executor io error: {0}")]
    Io(String),
}

/// Errors produced by the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid run specification: {0}")]
    Specification(String),

    #[error("agent {agent_id} cannot apply {event_type} in state {state}")]
    InvalidTransition {
        agent_id: String,
        state: AgentState,
        event_type: String,
    },

    #[error("{scope} {kind} budget exceeded for {subject}")]
    BudgetExceeded {
        scope: BudgetScope,
        kind: LimitKind,
        subject: String,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("verifier {agent_id} did not report within {timeout_secs}s")]
    VerificationTimeout { agent_id: String, timeout_secs: u64 },

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("event bus is closed")]
    BusClosed,

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error ends the whole run.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Specification(_)
                | EngineError::BudgetExceeded {
                    scope: BudgetScope::Run,
                    ..
                }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
