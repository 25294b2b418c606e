//! Agentry core library.
//!
//! Orchestrates pools of builder, verifier and operator agents for one run:
//! an ordered event bus, budget and time accounting, the agent lifecycle
//! state machine, the verification gate and the orchestration loop tying
//! them together.

pub mod agents;
pub mod backend;
pub mod budget;
pub mod bus;
pub mod config;
pub mod domain;
pub mod engine;
pub mod executor;
pub mod fakes;
pub mod gate;
pub mod lifecycle;
pub mod metrics;
pub mod obs;
pub mod sink;
pub mod telemetry;

pub use domain::{
    kinds, AgentRole, AgentSpec, AgentState, BackendError, BuildArtifact, EngineError, Event,
    ExecutorError, Phase, PromotionDecision, Result, RunSpecification, VerificationOutcome,
    VerifyStrategy,
};

pub use agents::{Agent, AgentAssignment, AgentContext, AgentError, AgentFactory, BuiltinAgentFactory};
pub use backend::{Completion, CompletionRequest, LlmBackend, RetryPolicy, TokenUsage};
pub use budget::{BudgetMonitor, Headroom, LedgerSnapshot, Limits, Usage};
pub use bus::{EventBus, EventFilter, Subscription};
pub use config::{load_run_spec, parse_run_spec, ConfigFormat, Template};
pub use engine::{Engine, EngineConfig, EngineHandle, RunOutcome, RunStatus};
pub use executor::{CommandOutput, ProjectExecutor};
pub use gate::{GateState, VerificationGate};
pub use lifecycle::{AgentSnapshot, LifecycleManager};
pub use sink::{FileSink, LogRecord, LogSink, SinkError, TracingSink};
