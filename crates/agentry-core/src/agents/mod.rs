//! Built-in agents and the factory that creates them.
//!
//! Roles form a closed set ([`AgentKind`]); each implements the same
//! capability set ([`Agent`]): `start`, `handle_event`, `cancel`. The engine
//! only sees `Box<dyn Agent>` handed out by an [`AgentFactory`], so tests and
//! embedders can substitute their own agents.

pub mod builder;
pub mod context;
pub mod operator;
pub mod verifier;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn, Instrument};

use crate::domain::{
    kinds, AgentRole, AgentSpec, BackendError, BuildArtifact, EngineError, Event, ExecutorError,
    ProjectSpec, TestSpec,
};

pub use builder::BuilderAgent;
pub use context::AgentContext;
pub use operator::OperatorAgent;
pub use verifier::VerifierAgent;

/// Why an agent stopped before finishing its work.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent was cancelled")]
    Cancelled,

    #[error("agent budget exhausted")]
    BudgetExhausted,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<BackendError> for AgentError {
    fn from(err: BackendError) -> Self {
        AgentError::Engine(EngineError::Backend(err))
    }
}

impl From<ExecutorError> for AgentError {
    fn from(err: ExecutorError) -> Self {
        AgentError::Engine(EngineError::Executor(err))
    }
}

/// What an agent instance is asked to do.
#[derive(Debug, Clone, Default)]
pub struct AgentAssignment {
    pub project: Option<ProjectSpec>,
    /// Phase goal shared by every agent of the phase.
    pub phase_goal: String,
    /// Tests assigned to a verifier.
    pub tests: Vec<TestSpec>,
    /// Commands assigned to an operator.
    pub commands: Vec<String>,
    /// Artifact under verification or operation.
    pub artifact: Option<BuildArtifact>,
}

/// Capability set shared by every agent.
#[async_trait]
pub trait Agent: Send {
    /// Do the agent's work. The returned JSON becomes the `agent.completed` payload.
    async fn start(&mut self, ctx: &mut AgentContext) -> Result<serde_json::Value, AgentError>;

    /// React to an `agent.message` routed to this agent.
    async fn handle_event(&mut self, ctx: &mut AgentContext, event: Event) -> Result<(), AgentError>;

    /// Release anything held after a cancellation.
    fn cancel(&mut self);
}

/// The built-in roles.
pub enum AgentKind {
    Builder(BuilderAgent),
    Verifier(VerifierAgent),
    Operator(OperatorAgent),
}

#[async_trait]
impl Agent for AgentKind {
    async fn start(&mut self, ctx: &mut AgentContext) -> Result<serde_json::Value, AgentError> {
        match self {
            AgentKind::Builder(a) => a.start(ctx).await,
            AgentKind::Verifier(a) => a.start(ctx).await,
            AgentKind::Operator(a) => a.start(ctx).await,
        }
    }

    async fn handle_event(&mut self, ctx: &mut AgentContext, event: Event) -> Result<(), AgentError> {
        match self {
            AgentKind::Builder(a) => a.handle_event(ctx, event).await,
            AgentKind::Verifier(a) => a.handle_event(ctx, event).await,
            AgentKind::Operator(a) => a.handle_event(ctx, event).await,
        }
    }

    fn cancel(&mut self) {
        match self {
            AgentKind::Builder(a) => a.cancel(),
            AgentKind::Verifier(a) => a.cancel(),
            AgentKind::Operator(a) => a.cancel(),
        }
    }
}

/// Creates agents for spawned instances.
pub trait AgentFactory: Send + Sync {
    fn create(&self, agent_id: &str, spec: &AgentSpec, assignment: AgentAssignment) -> Box<dyn Agent>;
}

/// Factory for the built-in roles.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinAgentFactory;

impl AgentFactory for BuiltinAgentFactory {
    fn create(&self, agent_id: &str, spec: &AgentSpec, assignment: AgentAssignment) -> Box<dyn Agent> {
        debug!(agent_id = %agent_id, role = %spec.role, "creating built-in agent");
        Box::new(match spec.role {
            AgentRole::Builder => AgentKind::Builder(BuilderAgent::new(assignment)),
            AgentRole::Verifier => AgentKind::Verifier(VerifierAgent::new(assignment)),
            AgentRole::Operator => AgentKind::Operator(OperatorAgent::new(assignment)),
        })
    }
}

/// Hand delivered messages to the agent. Called by agents between steps.
pub async fn dispatch_messages(
    agent: &mut (impl Agent + ?Sized),
    ctx: &mut AgentContext,
) -> Result<(), AgentError> {
    for message in ctx.take_messages() {
        agent.handle_event(ctx, message).await?;
    }
    Ok(())
}

/// Task body for one agent instance.
///
/// Publishes `agent.started`, runs the agent and reports the outcome.
/// Cancellation and budget exhaustion are already known to the engine, so
/// nothing further is published for them.
pub async fn run_agent(mut agent: Box<dyn Agent>, mut ctx: AgentContext) {
    let agent_id = ctx.agent_id().to_string();
    let span = tracing::info_span!("agent", agent_id = %agent_id);

    async move {
        if ctx.checkpoint().await.is_err() {
            debug!("cancelled before start");
            agent.cancel();
            return;
        }
        if ctx.publish(kinds::AGENT_STARTED, json!({})).await.is_err() {
            return;
        }

        let outcome = agent.start(&mut ctx).await;
        let report = match outcome {
            Ok(summary) => {
                info!("agent completed");
                ctx.publish(kinds::AGENT_COMPLETED, summary).await
            }
            Err(AgentError::Cancelled) => {
                info!("agent cancelled");
                agent.cancel();
                return;
            }
            Err(AgentError::BudgetExhausted) => {
                warn!("agent stopped: budget exhausted");
                agent.cancel();
                return;
            }
            Err(AgentError::Engine(EngineError::BusClosed)) => return,
            Err(AgentError::Engine(err)) => {
                warn!(error = %err, "agent failed");
                ctx.publish(kinds::AGENT_ERROR, json!({ "error": err.to_string() }))
                    .await
            }
        };
        if let Err(err) = report {
            debug!(error = %err, "final agent event not published");
        }
    }
    .instrument(span)
    .await
}

/// Rough byte budget for prompt excerpts.
pub(crate) fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
