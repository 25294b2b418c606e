//! Structured observability hooks for run lifecycle events.
//!
//! This module provides:
//! - The run-scoped span every loop and agent future is instrumented with
//! - Emission functions for run start/finish, budget breaches and gate decisions
//!
//! Events are emitted at `info!` level unless noted. Filtering follows `RUST_LOG`.

use tracing::{info, warn};

use crate::domain::{BudgetScope, LimitKind};

/// Span for work done inside the run, to attach to spawned futures.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("agentry.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, project: &str, agents: usize) {
    info!(event = "run.started", run_id = %run_id, project = %project, agents = agents);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, total_events: u64, completed: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        total_events = total_events,
        completed = completed,
    );
}

/// Budget cap reached (warning level).
pub fn emit_budget_exceeded(subject: &str, scope: BudgetScope, kind: LimitKind, used: f64, cap: f64) {
    warn!(
        event = "budget.exceeded",
        subject = %subject,
        scope = %scope,
        kind = %kind,
        used = used,
        cap = cap,
    );
}

pub fn emit_gate_decided(artifact_id: &str, promoted: bool, violations: usize) {
    info!(
        event = "gate.decided",
        artifact_id = %artifact_id,
        promoted = promoted,
        violations = violations,
    );
}

/// Rejected lifecycle transition (warning level).
pub fn emit_invalid_transition(agent_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "agent.transition_invalid", agent_id = %agent_id, error = %error);
}
