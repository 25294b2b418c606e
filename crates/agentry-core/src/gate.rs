//! Verification gate.
//!
//! Tracks each build artifact through `AwaitingVerification -> {Promoted,
//! Rejected}`. Outcomes are collected per verifier; once every expected
//! verifier has reported (or timed out, or ended without a report) the
//! outcomes are evaluated against the thresholds and the decision is frozen.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::domain::{
    AgentState, BuildArtifact, EngineError, GateRule, PromotionDecision, Result, Thresholds,
    VerificationOutcome, VerifyStrategy, Violation,
};
use crate::metrics::METRICS;
use crate::obs;

// ---------------------------------------------------------------------------
// Rule evaluation
// ---------------------------------------------------------------------------

/// Rules implied by a threshold set. `AllPassed` always applies.
pub fn rules_for(thresholds: &Thresholds) -> Vec<GateRule> {
    let mut rules = vec![GateRule::AllPassed];
    if let Some(min) = thresholds.min_test_coverage {
        rules.push(GateRule::MinTestCoverage { min });
    }
    if let Some(max) = thresholds.max_critical_issues {
        rules.push(GateRule::MaxCriticalIssues { max });
    }
    rules
}

/// Evaluate outcomes against thresholds. Promote iff there are no violations.
pub fn evaluate_outcomes(
    thresholds: &Thresholds,
    outcomes: &[VerificationOutcome],
) -> PromotionDecision {
    let mut violations = Vec::new();
    for rule in rules_for(thresholds) {
        check_rule(&rule, outcomes, &mut violations);
    }
    if violations.is_empty() {
        PromotionDecision::Promoted
    } else {
        PromotionDecision::Rejected { violations }
    }
}

fn check_rule(rule: &GateRule, outcomes: &[VerificationOutcome], out: &mut Vec<Violation>) {
    match rule {
        GateRule::AllPassed => {
            if outcomes.is_empty() {
                out.push(Violation {
                    rule: rule.clone(),
                    reason: "no verification outcomes were reported".to_string(),
                });
            }
            for outcome in outcomes.iter().filter(|o| !o.passed) {
                out.push(Violation {
                    rule: rule.clone(),
                    reason: match &outcome.detail {
                        Some(detail) => format!("{} failed: {detail}", outcome.test_type),
                        None => format!("{} failed", outcome.test_type),
                    },
                });
            }
        }
        GateRule::MinTestCoverage { min } => {
            for outcome in outcomes {
                match outcome.metrics.coverage {
                    Some(coverage) if coverage >= *min => {}
                    Some(coverage) => out.push(Violation {
                        rule: rule.clone(),
                        reason: format!(
                            "{} coverage {coverage:.1}% < required {min:.1}%",
                            outcome.test_type
                        ),
                    }),
                    None => out.push(Violation {
                        rule: rule.clone(),
                        reason: format!(
                            "{} reported no coverage, required {min:.1}%",
                            outcome.test_type
                        ),
                    }),
                }
            }
        }
        GateRule::MaxCriticalIssues { max } => {
            let total: u32 = outcomes
                .iter()
                .filter_map(|o| o.metrics.critical_issues)
                .sum();
            if total > *max {
                out.push(Violation {
                    rule: rule.clone(),
                    reason: format!("{total} critical issues > allowed {max}"),
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Gate state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    AwaitingVerification,
    Promoted,
    Rejected,
}

/// Something the gate decided while expiring deadlines.
#[derive(Debug, Clone, PartialEq)]
pub enum GateUpdate {
    TimedOut {
        artifact_id: String,
        verifier_id: String,
    },
    Decided {
        artifact_id: String,
        decision: PromotionDecision,
    },
}

#[derive(Debug)]
struct ArtifactRecord {
    artifact: BuildArtifact,
    expected: BTreeSet<String>,
    outcomes: BTreeMap<String, Vec<VerificationOutcome>>,
    deadlines: BTreeMap<String, Instant>,
    decision: Option<PromotionDecision>,
}

impl ArtifactRecord {
    fn outstanding(&self) -> Vec<String> {
        self.expected
            .iter()
            .filter(|v| !self.outcomes.contains_key(*v))
            .cloned()
            .collect()
    }
}

/// Per-artifact promotion state machine.
#[derive(Debug)]
pub struct VerificationGate {
    strategy: VerifyStrategy,
    thresholds: Thresholds,
    timeout: Duration,
    artifacts: BTreeMap<String, ArtifactRecord>,
}

impl VerificationGate {
    pub fn new(strategy: VerifyStrategy, thresholds: Thresholds, timeout: Duration) -> Self {
        Self {
            strategy,
            thresholds,
            timeout,
            artifacts: BTreeMap::new(),
        }
    }

    pub fn strategy(&self) -> VerifyStrategy {
        self.strategy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start awaiting verification of `artifact` by the given verifiers.
    pub fn register(&mut self, artifact: BuildArtifact, verifiers: Vec<String>) {
        let artifact_id = artifact.artifact_id.clone();
        debug!(artifact_id = %artifact_id, verifiers = verifiers.len(), "artifact awaiting verification");
        self.artifacts.insert(
            artifact_id,
            ArtifactRecord {
                artifact,
                expected: verifiers.into_iter().collect(),
                outcomes: BTreeMap::new(),
                deadlines: BTreeMap::new(),
                decision: None,
            },
        );
    }

    /// Arm the reporting deadline of a verifier that has just been started.
    pub fn start_verifier(&mut self, artifact_id: &str, verifier_id: &str, now: Instant) -> Result<()> {
        let timeout = self.timeout;
        let record = self.record_mut(artifact_id)?;
        if !record.expected.contains(verifier_id) {
            return Err(EngineError::UnknownAgent(verifier_id.to_string()));
        }
        record.deadlines.insert(verifier_id.to_string(), now + timeout);
        Ok(())
    }

    /// Record a verifier's report. Returns the decision if this report completed it.
    pub fn record(
        &mut self,
        artifact_id: &str,
        verifier_id: &str,
        outcomes: Vec<VerificationOutcome>,
    ) -> Result<Option<PromotionDecision>> {
        let thresholds = self.thresholds.clone();
        let record = self.record_mut(artifact_id)?;
        if !record.expected.contains(verifier_id) {
            return Err(EngineError::UnknownAgent(verifier_id.to_string()));
        }
        if record.decision.is_some() || record.outcomes.contains_key(verifier_id) {
            debug!(artifact_id = %artifact_id, verifier_id = %verifier_id, "late verification report ignored");
            return Ok(None);
        }
        record.outcomes.insert(verifier_id.to_string(), outcomes);
        record.deadlines.remove(verifier_id);
        Ok(Self::try_decide(&thresholds, artifact_id, record))
    }

    /// A verifier ended `Failed`/`Cancelled` without reporting.
    pub fn record_unreported(
        &mut self,
        artifact_id: &str,
        verifier_id: &str,
        state: AgentState,
    ) -> Result<Option<PromotionDecision>> {
        self.record(
            artifact_id,
            verifier_id,
            vec![VerificationOutcome::unreported(verifier_id, state)],
        )
    }

    /// Expire every armed deadline at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<GateUpdate> {
        let thresholds = self.thresholds.clone();
        let timeout_secs = self.timeout.as_secs();
        let mut updates = Vec::new();

        for (artifact_id, record) in self.artifacts.iter_mut() {
            if record.decision.is_some() {
                continue;
            }
            let expired: Vec<String> = record
                .deadlines
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            if expired.is_empty() {
                continue;
            }
            for verifier_id in expired {
                record.deadlines.remove(&verifier_id);
                record.outcomes.insert(
                    verifier_id.clone(),
                    vec![VerificationOutcome::timed_out(&verifier_id, timeout_secs)],
                );
                updates.push(GateUpdate::TimedOut {
                    artifact_id: artifact_id.clone(),
                    verifier_id,
                });
            }
            if let Some(decision) = Self::try_decide(&thresholds, artifact_id, record) {
                updates.push(GateUpdate::Decided {
                    artifact_id: artifact_id.clone(),
                    decision,
                });
            }
        }
        updates
    }

    fn try_decide(
        thresholds: &Thresholds,
        artifact_id: &str,
        record: &mut ArtifactRecord,
    ) -> Option<PromotionDecision> {
        if record.decision.is_some() || !record.outstanding().is_empty() {
            return None;
        }
        let outcomes: Vec<VerificationOutcome> =
            record.outcomes.values().flatten().cloned().collect();
        let decision = evaluate_outcomes(thresholds, &outcomes);
        METRICS.inc_gate_decisions();
        obs::emit_gate_decided(artifact_id, decision.is_promoted(), decision.violations().len());
        info!(
            artifact_id = %artifact_id,
            promoted = decision.is_promoted(),
            outcomes = outcomes.len(),
            "promotion decided"
        );
        record.decision = Some(decision.clone());
        Some(decision)
    }

    fn record_mut(&mut self, artifact_id: &str) -> Result<&mut ArtifactRecord> {
        self.artifacts.get_mut(artifact_id).ok_or_else(|| {
            EngineError::Specification(format!("artifact {artifact_id} is not registered"))
        })
    }

    pub fn decision(&self, artifact_id: &str) -> Option<&PromotionDecision> {
        self.artifacts.get(artifact_id)?.decision.as_ref()
    }

    pub fn state(&self, artifact_id: &str) -> Option<GateState> {
        let record = self.artifacts.get(artifact_id)?;
        Some(match &record.decision {
            None => GateState::AwaitingVerification,
            Some(PromotionDecision::Promoted) => GateState::Promoted,
            Some(PromotionDecision::Rejected { .. }) => GateState::Rejected,
        })
    }

    /// Whether operate agents may start for this artifact.
    pub fn may_spawn_operate(&self, artifact_id: &str) -> bool {
        if !self.strategy.blocks_operate() {
            return true;
        }
        self.decision(artifact_id)
            .is_some_and(PromotionDecision::is_promoted)
    }

    /// Verifiers that have neither reported nor timed out.
    pub fn outstanding(&self, artifact_id: &str) -> Vec<String> {
        self.artifacts
            .get(artifact_id)
            .map(ArtifactRecord::outstanding)
            .unwrap_or_default()
    }

    pub fn artifact(&self, artifact_id: &str) -> Option<&BuildArtifact> {
        self.artifacts.get(artifact_id).map(|r| &r.artifact)
    }

    /// All outcomes collected so far for an artifact.
    pub fn outcomes(&self, artifact_id: &str) -> Vec<VerificationOutcome> {
        self.artifacts
            .get(artifact_id)
            .map(|r| r.outcomes.values().flatten().cloned().collect())
            .unwrap_or_default()
    }
}
