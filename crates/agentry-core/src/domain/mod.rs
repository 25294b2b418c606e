//! Domain model for Agentry.
//!
//! - `RunSpecification`: validated description of a run
//! - `Event`: immutable bus event with a dotted type
//! - `AgentRole` / `AgentState`: agent vocabulary
//! - `VerificationOutcome` / `PromotionDecision`: verification results

pub mod agent;
pub mod error;
pub mod event;
pub mod spec;
pub mod verification;

pub use agent::{agent_id_for, AgentRole, AgentState, Phase};
pub use error::{BackendError, BudgetScope, EngineError, ExecutorError, LimitKind, Result};
pub use event::{kinds, Event};
pub use spec::{
    AgentSpec, BuildPhase, Constraints, LogFormat, LogLevel, LoggingSpec, OperatePhase,
    PhaseBudget, ProjectSpec, RunSpecification, SinkSpec, TestSpec, Thresholds, VerifyPhase,
    VerifyStrategy,
};
pub use verification::{
    content_digest, ArtifactFile, BuildArtifact, GateRule, OutcomeMetrics, PromotionDecision,
    VerificationOutcome, Violation,
};
