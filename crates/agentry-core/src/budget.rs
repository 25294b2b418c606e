//! Budget & time accounting against run and agent caps.
//!
//! Money is tracked in integer micro-dollars and time in microseconds so the
//! per-agent entries always sum exactly to the run aggregate. The monitor is
//! owned by the orchestration loop; nothing else mutates the ledger.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{kinds, BudgetScope, EngineError, LimitKind, Result};

const MICROS_PER_USD: f64 = 1_000_000.0;
const MICROS_PER_SEC: f64 = 1_000_000.0;

fn usd_to_micros(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * MICROS_PER_USD).round() as u64
    } else {
        0
    }
}

fn secs_to_micros(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        (secs * MICROS_PER_SEC).round() as u64
    } else {
        0
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Resources consumed by one unit of agent work.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub cost_usd: f64,
    pub elapsed_secs: f64,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl Usage {
    pub fn cost(cost_usd: f64) -> Self {
        Self {
            cost_usd,
            ..Self::default()
        }
    }

    pub fn elapsed(elapsed_secs: f64) -> Self {
        Self {
            elapsed_secs,
            ..Self::default()
        }
    }
}

/// Cost and time caps for one scope. `None` means uncapped.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Limits {
    pub max_cost_usd: Option<f64>,
    pub max_runtime_secs: Option<f64>,
}

impl Limits {
    pub fn new(max_cost_usd: Option<f64>, max_runtime_secs: Option<f64>) -> Self {
        Self {
            max_cost_usd,
            max_runtime_secs,
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    fn cost_micros(&self) -> Option<u64> {
        self.max_cost_usd.map(usd_to_micros)
    }

    fn time_micros(&self) -> Option<u64> {
        self.max_runtime_secs.map(secs_to_micros)
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Entry {
    cost_micros: u64,
    elapsed_micros: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl Entry {
    fn add(&mut self, other: &Entry) {
        self.cost_micros += other.cost_micros;
        self.elapsed_micros += other.elapsed_micros;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    fn usage(&self) -> AgentUsage {
        AgentUsage {
            cost_usd: self.cost_micros as f64 / MICROS_PER_USD,
            elapsed_seconds: self.elapsed_micros as f64 / MICROS_PER_SEC,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
        }
    }
}

impl From<&Usage> for Entry {
    fn from(usage: &Usage) -> Self {
        Self {
            cost_micros: usd_to_micros(usage.cost_usd),
            elapsed_micros: secs_to_micros(usage.elapsed_secs),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        }
    }
}

/// Accumulated usage of one agent (or the run).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentUsage {
    pub cost_usd: f64,
    pub elapsed_seconds: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Point-in-time copy of the ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LedgerSnapshot {
    pub total: AgentUsage,
    /// Wall-clock seconds since the run started.
    pub run_elapsed_seconds: f64,
    pub agents: BTreeMap<String, AgentUsage>,
}

/// Remaining budget after an accounting update.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Headroom {
    pub agent_cost_usd: Option<f64>,
    pub agent_time_secs: Option<f64>,
    pub run_cost_usd: Option<f64>,
    pub run_time_secs: Option<f64>,
    pub agent_exhausted: bool,
    pub run_exhausted: bool,
}

impl Headroom {
    /// Whether the agent must stop.
    pub fn exhausted(&self) -> bool {
        self.agent_exhausted || self.run_exhausted
    }
}

// ---------------------------------------------------------------------------
// Threshold crossings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdLevel {
    Warning,
    Exceeded,
}

/// A cap crossed by an accounting update or a time check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCrossing {
    pub level: ThresholdLevel,
    pub scope: BudgetScope,
    pub kind: LimitKind,
    /// Agent id for agent scope, `run` for run scope.
    pub subject: String,
    pub used: f64,
    pub cap: f64,
}

impl ThresholdCrossing {
    pub fn event_type(&self) -> &'static str {
        match (self.level, self.kind) {
            (ThresholdLevel::Warning, _) => kinds::RESOURCE_LIMIT_WARNING,
            (ThresholdLevel::Exceeded, LimitKind::Cost) => kinds::RESOURCE_LIMIT_COST,
            (ThresholdLevel::Exceeded, LimitKind::Time) => kinds::RESOURCE_LIMIT_TIME,
        }
    }

    /// Agent the crossing belongs to, if agent-scoped.
    pub fn agent_id(&self) -> Option<&str> {
        match self.scope {
            BudgetScope::Agent => Some(&self.subject),
            BudgetScope::Run => None,
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        json!({
            "scope": self.scope,
            "kind": self.kind,
            "subject": self.subject,
            "used": self.used,
            "cap": self.cap,
            "percentage": if self.cap > 0.0 { self.used / self.cap * 100.0 } else { 100.0 },
        })
    }

    pub fn into_error(&self) -> EngineError {
        EngineError::BudgetExceeded {
            scope: self.scope,
            kind: self.kind,
            subject: self.subject.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Cost/time ledger plus threshold tracking for one run.
#[derive(Debug)]
pub struct BudgetMonitor {
    run_limits: Limits,
    warning_ratio: f64,
    started: Instant,
    total: Entry,
    agents: BTreeMap<String, Entry>,
    slices: HashMap<String, Limits>,
    // (subject, scope, kind, level) already reported.
    reported: HashSet<(String, BudgetScope, LimitKind, ThresholdLevel)>,
}

impl BudgetMonitor {
    pub fn new(run_limits: Limits, warning_ratio: f64) -> Self {
        Self {
            run_limits,
            warning_ratio,
            started: Instant::now(),
            total: Entry::default(),
            agents: BTreeMap::new(),
            slices: HashMap::new(),
            reported: HashSet::new(),
        }
    }

    /// Register an agent's slice. Re-registering replaces the slice.
    pub fn register(&mut self, agent_id: &str, slice: Limits) {
        self.slices.insert(agent_id.to_string(), slice);
        self.agents.entry(agent_id.to_string()).or_default();
    }

    pub fn slice(&self, agent_id: &str) -> Option<Limits> {
        self.slices.get(agent_id).copied()
    }

    pub fn run_limits(&self) -> Limits {
        self.run_limits
    }

    /// Apply usage to the agent entry and the aggregate in one step.
    pub fn account(&mut self, agent_id: &str, usage: &Usage) -> Result<Headroom> {
        let delta = Entry::from(usage);
        let entry = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::UnknownAgent(agent_id.to_string()))?;
        entry.add(&delta);
        self.total.add(&delta);
        debug!(
            agent_id = %agent_id,
            cost_micros = delta.cost_micros,
            elapsed_micros = delta.elapsed_micros,
            total_cost_micros = self.total.cost_micros,
            "usage accounted"
        );
        self.headroom(agent_id)
    }

    /// Remaining budget for an agent and the run.
    pub fn headroom(&self, agent_id: &str) -> Result<Headroom> {
        let entry = self
            .agents
            .get(agent_id)
            .ok_or_else(|| EngineError::UnknownAgent(agent_id.to_string()))?;
        let slice = self.slices.get(agent_id).copied().unwrap_or_default();

        let agent_cost = remaining(slice.cost_micros(), entry.cost_micros);
        let agent_time = remaining(slice.time_micros(), entry.elapsed_micros);
        let run_cost = remaining(self.run_limits.cost_micros(), self.total.cost_micros);
        let run_time = remaining(self.run_limits.time_micros(), self.run_elapsed_micros());

        Ok(Headroom {
            agent_cost_usd: agent_cost.map(|m| m as f64 / MICROS_PER_USD),
            agent_time_secs: agent_time.map(|m| m as f64 / MICROS_PER_SEC),
            run_cost_usd: run_cost.map(|m| m as f64 / MICROS_PER_USD),
            run_time_secs: run_time.map(|m| m as f64 / MICROS_PER_SEC),
            agent_exhausted: agent_cost == Some(0) || agent_time == Some(0),
            run_exhausted: run_cost == Some(0) || run_time == Some(0),
        })
    }

    /// Crossings caused by the agent's latest update, each reported once.
    pub fn check_thresholds(&mut self, agent_id: &str) -> Vec<ThresholdCrossing> {
        let mut crossings = Vec::new();
        let entry = self.agents.get(agent_id).copied().unwrap_or_default();
        let slice = self.slices.get(agent_id).copied().unwrap_or_default();

        self.check(
            &mut crossings,
            agent_id,
            BudgetScope::Agent,
            LimitKind::Cost,
            entry.cost_micros,
            slice.cost_micros(),
            MICROS_PER_USD,
        );
        self.check(
            &mut crossings,
            agent_id,
            BudgetScope::Agent,
            LimitKind::Time,
            entry.elapsed_micros,
            slice.time_micros(),
            MICROS_PER_SEC,
        );
        crossings.extend(self.check_run());
        crossings
    }

    /// Run-level checks: aggregate cost and wall-clock time.
    pub fn check_run(&mut self) -> Vec<ThresholdCrossing> {
        let mut crossings = Vec::new();
        let cost = self.total.cost_micros;
        let elapsed = self.run_elapsed_micros();
        self.check(
            &mut crossings,
            "run",
            BudgetScope::Run,
            LimitKind::Cost,
            cost,
            self.run_limits.cost_micros(),
            MICROS_PER_USD,
        );
        self.check(
            &mut crossings,
            "run",
            BudgetScope::Run,
            LimitKind::Time,
            elapsed,
            self.run_limits.time_micros(),
            MICROS_PER_SEC,
        );
        crossings
    }

    #[allow(clippy::too_many_arguments)]
    fn check(
        &mut self,
        out: &mut Vec<ThresholdCrossing>,
        subject: &str,
        scope: BudgetScope,
        kind: LimitKind,
        used: u64,
        cap: Option<u64>,
        unit: f64,
    ) {
        let Some(cap) = cap else {
            return;
        };
        let level = if used >= cap {
            ThresholdLevel::Exceeded
        } else if used as f64 >= cap as f64 * self.warning_ratio {
            ThresholdLevel::Warning
        } else {
            return;
        };

        let key = (subject.to_string(), scope, kind, level);
        if self.reported.contains(&key) {
            return;
        }
        self.reported.insert(key);
        if level == ThresholdLevel::Exceeded {
            // A jump straight past the cap does not warn afterwards.
            self.reported
                .insert((subject.to_string(), scope, kind, ThresholdLevel::Warning));
        }
        out.push(ThresholdCrossing {
            level,
            scope,
            kind,
            subject: subject.to_string(),
            used: used as f64 / unit,
            cap: cap as f64 / unit,
        });
    }

    fn run_elapsed_micros(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    pub fn run_elapsed_secs(&self) -> f64 {
        self.run_elapsed_micros() as f64 / MICROS_PER_SEC
    }

    pub fn agent_usage(&self, agent_id: &str) -> Option<AgentUsage> {
        self.agents.get(agent_id).map(Entry::usage)
    }

    pub fn total(&self) -> AgentUsage {
        self.total.usage()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            total: self.total.usage(),
            run_elapsed_seconds: self.run_elapsed_secs(),
            agents: self
                .agents
                .iter()
                .map(|(id, entry)| (id.clone(), entry.usage()))
                .collect(),
        }
    }

    /// Per-agent sums equal the aggregate. Holds after every `account`.
    pub fn is_consistent(&self) -> bool {
        let mut sum = Entry::default();
        for entry in self.agents.values() {
            sum.add(entry);
        }
        sum == self.total
    }
}

fn remaining(cap: Option<u64>, used: u64) -> Option<u64> {
    cap.map(|cap| cap.saturating_sub(used))
}
