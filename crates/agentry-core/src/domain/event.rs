//! Bus events and the dotted event taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event type names. Families share a dotted prefix (`build.`, `verify.`, ...).
pub mod kinds {
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_COMPLETED: &str = "run.completed";
    pub const RUN_ABORTED: &str = "run.aborted";

    pub const AGENT_SPAWNED: &str = "agent.spawned";
    pub const AGENT_STARTED: &str = "agent.started";
    pub const AGENT_PAUSED: &str = "agent.paused";
    pub const AGENT_RESUMED: &str = "agent.resumed";
    pub const AGENT_COMPLETED: &str = "agent.completed";
    pub const AGENT_FAILED: &str = "agent.failed";
    pub const AGENT_CANCELLED: &str = "agent.cancelled";
    pub const AGENT_USAGE: &str = "agent.usage";
    pub const AGENT_ERROR: &str = "agent.error";
    pub const AGENT_MESSAGE: &str = "agent.message";
    pub const AGENT_TRANSITION_INVALID: &str = "agent.transition.invalid";

    /// Control: cancel one agent (`agent_id` set) or the whole run (`agent_id` unset).
    pub const AGENT_CANCEL: &str = "agent.cancel";
    /// Control: resume a paused agent.
    pub const AGENT_RESUME: &str = "agent.resume";

    pub const BUILD_START: &str = "build.start";
    pub const BUILD_STEP_START: &str = "build.step.start";
    pub const BUILD_STEP_COMPLETED: &str = "build.step.completed";
    pub const BUILD_STEP_FAILED: &str = "build.step.failed";
    pub const BUILD_COMPLETED: &str = "build.completed";
    pub const BUILD_FAILED: &str = "build.failed";
    pub const BUILD_ARTIFACT_READY: &str = "build.artifact.ready";

    pub const VERIFY_START: &str = "verify.start";
    pub const VERIFY_TEST_PASSED: &str = "verify.test.passed";
    pub const VERIFY_TEST_FAILED: &str = "verify.test.failed";
    pub const VERIFY_REPORT: &str = "verify.report";
    pub const VERIFY_GATE_PROMOTED: &str = "verify.gate.promoted";
    pub const VERIFY_GATE_REJECTED: &str = "verify.gate.rejected";

    pub const OPERATE_START: &str = "operate.start";
    pub const OPERATE_AGENT_SPAWNED: &str = "operate.agent.spawned";
    pub const OPERATE_ACTION: &str = "operate.action";
    pub const OPERATE_COMPLETED: &str = "operate.completed";

    pub const RESOURCE_LIMIT_WARNING: &str = "resource.limit.warning";
    pub const RESOURCE_LIMIT_COST: &str = "resource.limit.cost";
    pub const RESOURCE_LIMIT_TIME: &str = "resource.limit.time";

    /// Events an agent emits while doing its job. Rejected while the agent
    /// is pending, paused or finished.
    pub fn is_work(event_type: &str) -> bool {
        (event_type.starts_with("build.")
            || event_type.starts_with("verify.")
            || event_type.starts_with("operate."))
            && !matches!(
                event_type,
                BUILD_START
                    | VERIFY_START
                    | OPERATE_START
                    | VERIFY_GATE_PROMOTED
                    | VERIFY_GATE_REJECTED
                    | OPERATE_AGENT_SPAWNED
            )
    }

    /// Events emitted on behalf of the engine rather than an agent.
    pub fn is_engine_owned(event_type: &str) -> bool {
        event_type.starts_with("run.")
            || event_type.starts_with("resource.")
            || matches!(
                event_type,
                AGENT_SPAWNED
                    | AGENT_PAUSED
                    | AGENT_RESUMED
                    | AGENT_CANCELLED
                    | AGENT_TRANSITION_INVALID
                    | BUILD_START
                    | BUILD_ARTIFACT_READY
                    | VERIFY_START
                    | VERIFY_GATE_PROMOTED
                    | VERIFY_GATE_REJECTED
                    | OPERATE_START
                    | OPERATE_AGENT_SPAWNED
            )
    }
}

/// One immutable bus event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Bus-assigned sequence number; strictly increasing per run.
    pub seq: u64,

    pub timestamp: DateTime<Utc>,

    /// Dotted type name, see [`kinds`].
    #[serde(rename = "type")]
    pub event_type: String,

    /// Emitting or targeted agent, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    pub run_id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// Event-specific JSON object.
    pub payload: serde_json::Value,
}

impl Event {
    /// Create an unpublished event. The bus overwrites `seq` on publish.
    pub fn new(run_id: Uuid, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            event_type: event_type.into(),
            agent_id: None,
            run_id,
            trace_id: None,
            payload,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    /// The family prefix, e.g. `build` for `build.step.completed`.
    pub fn family(&self) -> &str {
        self.event_type
            .split_once('.')
            .map_or(self.event_type.as_str(), |(family, _)| family)
    }

    /// Read a string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}
