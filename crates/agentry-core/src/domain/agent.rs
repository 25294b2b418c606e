//! Agent vocabulary: roles, lifecycle states and phases.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The three agent archetypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Builder,
    Verifier,
    Operator,
}

impl AgentRole {
    /// The phase agents of this role belong to.
    pub fn phase(self) -> Phase {
        match self {
            AgentRole::Builder => Phase::Build,
            AgentRole::Verifier => Phase::Verify,
            AgentRole::Operator => Phase::Operate,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentRole::Builder => "builder",
            AgentRole::Verifier => "verifier",
            AgentRole::Operator => "operator",
        };
        write!(f, "{s}")
    }
}

/// A logical stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Build,
    Verify,
    Operate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Build => "build",
            Phase::Verify => "verify",
            Phase::Operate => "operate",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle state of an agent instance.
///
/// `Pending → Running → {Completed, Failed, Cancelled}`, with a
/// `Running ⇄ Paused` detour driven by budget warnings and explicit resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl AgentState {
    /// Whether the instance has finished for good.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentState::Completed | AgentState::Failed | AgentState::Cancelled
        )
    }

    /// Whether the instance still holds a claim on budget.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Pending => "pending",
            AgentState::Running => "running",
            AgentState::Paused => "paused",
            AgentState::Completed => "completed",
            AgentState::Failed => "failed",
            AgentState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Build an instance id from a role, 1-based spec index and 1-based replica.
pub fn agent_id_for(role: AgentRole, spec_index: usize, replica: u32) -> String {
    format!("{role}-{spec_index}-{replica}")
}
