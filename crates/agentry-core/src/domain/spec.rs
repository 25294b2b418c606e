//! Run specification: the immutable, validated input of a run.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::agent::{AgentRole, Phase};
use super::error::{EngineError, Result};

/// Declarative description of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSpecification {
    pub project: ProjectSpec,

    pub build: BuildPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifyPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operate: Option<OperatePhase>,

    #[serde(default)]
    pub constraints: Constraints,

    #[serde(default)]
    pub logging: LoggingSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// One agent template. `count` identical instances are spawned from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSpec {
    pub role: AgentRole,

    /// Individual goal, combined with the phase goal in prompts.
    #[serde(default)]
    pub goal: String,

    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_count")]
    pub count: u32,

    /// Explicit per-instance cost slice; overrides the proportional share.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,

    /// Explicit per-instance time slice; overrides the proportional share.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_min: Option<f64>,

    /// Backend retries before the agent gives up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl AgentSpec {
    /// Minimal spec with defaults, mostly useful for tests and templates.
    pub fn new(role: AgentRole, model: impl Into<String>) -> Self {
        Self {
            role,
            goal: String::new(),
            model: model.into(),
            temperature: default_temperature(),
            count: default_count(),
            max_cost_usd: None,
            max_runtime_min: None,
            max_retries: default_max_retries(),
            max_tokens: default_max_tokens(),
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    pub fn with_max_cost_usd(mut self, max_cost_usd: f64) -> Self {
        self.max_cost_usd = Some(max_cost_usd);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildPhase {
    /// Overarching team goal shared by every builder.
    #[serde(default)]
    pub goal: String,

    pub agents: Vec<AgentSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_min: Option<f64>,
}

/// How verifiers are scheduled and when operate agents may start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStrategy {
    #[default]
    Sequential,
    Parallel,
    Gated,
}

impl VerifyStrategy {
    /// Whether verifiers are started one after another.
    pub fn runs_serially(self) -> bool {
        matches!(self, VerifyStrategy::Sequential | VerifyStrategy::Gated)
    }

    /// Whether operate-phase spawning waits for a `Promoted` decision.
    pub fn blocks_operate(self) -> bool {
        matches!(self, VerifyStrategy::Gated)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifyPhase {
    #[serde(default)]
    pub strategy: VerifyStrategy,

    pub agents: Vec<AgentSpec>,

    #[serde(default)]
    pub tests: Vec<TestSpec>,

    #[serde(default)]
    pub thresholds: Thresholds,

    /// Per-verifier reporting deadline.
    #[serde(default = "default_verify_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_min: Option<f64>,
}

/// Promotion thresholds. Every configured threshold must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    /// Minimum coverage percentage (0–100) each outcome must report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_test_coverage: Option<f64>,

    /// Maximum critical issues summed over all outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_critical_issues: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestSpec {
    #[serde(rename = "type")]
    pub test_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Shell command run through the executor; exit code 0 passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default = "default_test_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatePhase {
    #[serde(default = "default_runtime")]
    pub runtime: String,

    pub agents: Vec<AgentSpec>,

    /// Operational commands run in order by each operator.
    #[serde(default)]
    pub commands: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_min: Option<f64>,
}

/// Run-level limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_min: Option<f64>,

    #[serde(default = "default_target_directory")]
    pub target_directory: PathBuf,

    /// Pause an agent when its slice crosses the warning ratio.
    #[serde(default)]
    pub pause_on_warning: bool,

    /// Fraction of a cap at which `resource.limit.warning` is emitted.
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_cost_usd: None,
            max_runtime_min: None,
            target_directory: default_target_directory(),
            pause_on_warning: false,
            warning_ratio: default_warning_ratio(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_tracing(self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Where structured run records are delivered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkSpec {
    #[default]
    Stdout,
    File {
        path: PathBuf,
    },
    Http {
        url: String,
        #[serde(default = "default_http_batch")]
        batch_size: usize,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoggingSpec {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub sink: SinkSpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_sinks: Vec<SinkSpec>,
}

impl LoggingSpec {
    /// Primary sink followed by any additional sinks.
    pub fn sinks(&self) -> impl Iterator<Item = &SinkSpec> {
        std::iter::once(&self.sink).chain(self.additional_sinks.iter())
    }
}

/// Caps that apply to one phase, with the number of instances sharing them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseBudget {
    pub max_cost_usd: Option<f64>,
    pub max_runtime_secs: Option<f64>,
    pub instance_count: u32,
}

impl RunSpecification {
    /// Agent templates configured for a phase (empty when the phase is absent).
    pub fn agents_for(&self, phase: Phase) -> &[AgentSpec] {
        match phase {
            Phase::Build => &self.build.agents,
            Phase::Verify => self.verify.as_ref().map_or(&[], |v| &v.agents),
            Phase::Operate => self.operate.as_ref().map_or(&[], |o| &o.agents),
        }
    }

    /// Caps shared by the instances of `phase`; falls back to the run caps.
    pub fn phase_budget(&self, phase: Phase) -> PhaseBudget {
        let (cost, minutes) = match phase {
            Phase::Build => (self.build.max_cost_usd, self.build.max_runtime_min),
            Phase::Verify => self
                .verify
                .as_ref()
                .map_or((None, None), |v| (v.max_cost_usd, v.max_runtime_min)),
            Phase::Operate => self
                .operate
                .as_ref()
                .map_or((None, None), |o| (o.max_cost_usd, o.max_runtime_min)),
        };
        PhaseBudget {
            max_cost_usd: cost.or(self.constraints.max_cost_usd),
            max_runtime_secs: minutes
                .or(self.constraints.max_runtime_min)
                .map(|m| m * 60.0),
            instance_count: self.agents_for(phase).iter().map(|a| a.count).sum(),
        }
    }

    /// Check every structural rule. The engine only accepts specs that pass.
    pub fn validate(&self) -> Result<()> {
        if self.project.name.trim().is_empty() {
            return Err(spec_error("project.name cannot be empty"));
        }
        if self.build.agents.is_empty() {
            return Err(spec_error("build.agents must list at least one agent"));
        }

        validate_agents("build", &self.build.agents, AgentRole::Builder)?;
        validate_caps("build", self.build.max_cost_usd, self.build.max_runtime_min)?;

        if let Some(verify) = &self.verify {
            if verify.agents.is_empty() {
                return Err(spec_error("verify.agents must list at least one agent"));
            }
            validate_agents("verify", &verify.agents, AgentRole::Verifier)?;
            validate_caps("verify", verify.max_cost_usd, verify.max_runtime_min)?;
            if verify.timeout_secs == 0 {
                return Err(spec_error("verify.timeout_secs must be positive"));
            }
            if let Some(min) = verify.thresholds.min_test_coverage {
                if !(0.0..=100.0).contains(&min) {
                    return Err(spec_error(format!(
                        "verify.thresholds.min_test_coverage must be within 0..=100, got {min}"
                    )));
                }
            }
            for test in &verify.tests {
                if test.test_type.trim().is_empty() {
                    return Err(spec_error("verify.tests[].type cannot be empty"));
                }
                if test.timeout_secs == 0 {
                    return Err(spec_error(format!(
                        "verify test {} must have a positive timeout",
                        test.test_type
                    )));
                }
            }
        }

        if let Some(operate) = &self.operate {
            if operate.agents.is_empty() {
                return Err(spec_error("operate.agents must list at least one agent"));
            }
            validate_agents("operate", &operate.agents, AgentRole::Operator)?;
            validate_caps("operate", operate.max_cost_usd, operate.max_runtime_min)?;
        }

        validate_caps(
            "constraints",
            self.constraints.max_cost_usd,
            self.constraints.max_runtime_min,
        )?;
        let ratio = self.constraints.warning_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(spec_error(format!(
                "constraints.warning_ratio must be within (0, 1], got {ratio}"
            )));
        }

        for sink in self.logging.sinks() {
            match sink {
                SinkSpec::Stdout => {}
                SinkSpec::File { path } if path.as_os_str().is_empty() => {
                    return Err(spec_error("file log sink requires a path"));
                }
                SinkSpec::File { .. } => {}
                SinkSpec::Http { url, batch_size } => {
                    if !(url.starts_with("http://") || url.starts_with("https://")) {
                        return Err(spec_error(format!("http log sink url is invalid: {url}")));
                    }
                    if *batch_size == 0 {
                        return Err(spec_error("http log sink batch_size must be positive"));
                    }
                }
            }
        }

        Ok(())
    }
}

fn validate_agents(section: &str, agents: &[AgentSpec], role: AgentRole) -> Result<()> {
    for (idx, agent) in agents.iter().enumerate() {
        if agent.role != role {
            return Err(spec_error(format!(
                "{section}.agents[{idx}] has role {} but the phase requires {role}",
                agent.role
            )));
        }
        validate_agent(agent).map_err(|e| match e {
            EngineError::Specification(msg) => {
                spec_error(format!("{section}.agents[{idx}]: {msg}"))
            }
            other => other,
        })?;
    }
    Ok(())
}

/// Rules that apply to a single agent template.
pub fn validate_agent(agent: &AgentSpec) -> Result<()> {
    if agent.count == 0 {
        return Err(spec_error("count must be at least 1"));
    }
    if agent.model.trim().is_empty() {
        return Err(spec_error("model cannot be empty"));
    }
    if !(0.0..=2.0).contains(&agent.temperature) {
        return Err(spec_error(format!(
            "temperature must be within 0.0..=2.0, got {}",
            agent.temperature
        )));
    }
    validate_caps("agent", agent.max_cost_usd, agent.max_runtime_min)
}

fn validate_caps(section: &str, cost: Option<f64>, minutes: Option<f64>) -> Result<()> {
    if let Some(cost) = cost {
        if !(cost.is_finite() && cost > 0.0) {
            return Err(spec_error(format!(
                "{section}.max_cost_usd must be positive, got {cost}"
            )));
        }
    }
    if let Some(minutes) = minutes {
        if !(minutes.is_finite() && minutes > 0.0) {
            return Err(spec_error(format!(
                "{section}.max_runtime_min must be positive, got {minutes}"
            )));
        }
    }
    Ok(())
}

fn spec_error(msg: impl Into<String>) -> EngineError {
    EngineError::Specification(msg.into())
}

fn default_temperature() -> f32 {
    0.7
}

fn default_count() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_verify_timeout_secs() -> u64 {
    600
}

fn default_test_timeout_secs() -> u64 {
    300
}

fn default_runtime() -> String {
    "local".to_string()
}

fn default_target_directory() -> PathBuf {
    PathBuf::from("./output")
}

fn default_warning_ratio() -> f64 {
    0.8
}

fn default_http_batch() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> RunSpecification {
        RunSpecification {
            project: ProjectSpec {
                name: "demo".to_string(),
                description: String::new(),
                version: None,
                tags: vec![],
            },
            build: BuildPhase {
                goal: "build a todo app".to_string(),
                agents: vec![AgentSpec::new(AgentRole::Builder, "gpt-4o").with_count(2)],
                max_cost_usd: None,
                max_runtime_min: None,
            },
            verify: None,
            operate: None,
            constraints: Constraints {
                max_cost_usd: Some(10.0),
                ..Constraints::default()
            },
            logging: LoggingSpec::default(),
        }
    }

    #[test]
    fn test_minimal_spec_is_valid() {
        minimal().validate().unwrap();
    }

    #[test]
    fn test_zero_count_is_rejected() {
        let mut spec = minimal();
        spec.build.agents[0].count = 0;
        let err = spec.validate().unwrap_err();
        assert!(matches!(err, EngineError::Specification(_)));
        assert!(err.to_string().contains("build.agents[0]"));
    }

    #[test]
    fn test_role_must_match_phase() {
        let mut spec = minimal();
        spec.build.agents[0].role = AgentRole::Verifier;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_phase_budget_falls_back_to_run_caps() {
        let spec = minimal();
        let budget = spec.phase_budget(Phase::Build);
        assert_eq!(budget.max_cost_usd, Some(10.0));
        assert_eq!(budget.max_runtime_secs, None);
        assert_eq!(budget.instance_count, 2);
        assert_eq!(spec.phase_budget(Phase::Verify).instance_count, 0);
    }

    #[test]
    fn test_phase_cap_overrides_run_cap() {
        let mut spec = minimal();
        spec.build.max_cost_usd = Some(4.0);
        spec.build.max_runtime_min = Some(2.0);
        let budget = spec.phase_budget(Phase::Build);
        assert_eq!(budget.max_cost_usd, Some(4.0));
        assert_eq!(budget.max_runtime_secs, Some(120.0));
    }

    #[test]
    fn test_invalid_warning_ratio() {
        let mut spec = minimal();
        spec.constraints.warning_ratio = 1.5;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_verify_defaults_from_json() {
        let verify: VerifyPhase = serde_json::from_value(serde_json::json!({
            "agents": [{"role": "verifier", "model": "m"}],
            "tests": [{"type": "unit", "command": "pytest"}],
            "thresholds": {"min_test_coverage": 80.0}
        }))
        .unwrap();
        assert_eq!(verify.strategy, VerifyStrategy::Sequential);
        assert_eq!(verify.timeout_secs, 600);
        assert_eq!(verify.tests[0].timeout_secs, 300);
        assert_eq!(verify.agents[0].count, 1);
    }

    #[test]
    fn test_sink_spec_tagging() {
        let sink: SinkSpec =
            serde_json::from_value(serde_json::json!({"type": "file", "path": "logs/run.ndjson"}))
                .unwrap();
        assert_eq!(
            sink,
            SinkSpec::File {
                path: PathBuf::from("logs/run.ndjson")
            }
        );
    }
}
