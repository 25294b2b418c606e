//! Run specification loading and starter templates.
//!
//! Specs are JSON, YAML or TOML, chosen by file extension. Every loaded spec
//! is validated; the engine never sees an unvalidated one.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{
    AgentRole, AgentSpec, BuildPhase, Constraints, EngineError, LoggingSpec, OperatePhase,
    ProjectSpec, Result, RunSpecification, SinkSpec, TestSpec, Thresholds, VerifyPhase,
    VerifyStrategy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Toml => "toml",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

/// Read, parse and validate a run specification.
pub fn load_run_spec(path: impl AsRef<Path>) -> Result<RunSpecification> {
    let path = path.as_ref();
    let format = ConfigFormat::from_path(path).ok_or_else(|| {
        EngineError::Specification(format!(
            "{}: unsupported config extension (expected .json, .yaml, .yml or .toml)",
            path.display()
        ))
    })?;
    let content = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Specification(format!("{}: cannot read config: {e}", path.display()))
    })?;
    debug!(path = %path.display(), format = format.extension(), "loading run specification");
    parse_run_spec(&content, format)
        .map_err(|e| EngineError::Specification(format!("{}: {}", path.display(), strip_prefix(&e))))
}

/// Parse and validate a run specification held in memory.
pub fn parse_run_spec(content: &str, format: ConfigFormat) -> Result<RunSpecification> {
    let spec: RunSpecification = match format {
        ConfigFormat::Json => serde_json::from_str(content)
            .map_err(|e| EngineError::Specification(format!("invalid JSON: {e}")))?,
        ConfigFormat::Yaml => serde_yaml::from_str(content)
            .map_err(|e| EngineError::Specification(format!("invalid YAML: {e}")))?,
        ConfigFormat::Toml => toml::from_str(content)
            .map_err(|e| EngineError::Specification(format!("invalid TOML: {e}")))?,
    };
    spec.validate()?;
    Ok(spec)
}

/// Serialize a specification in the given format.
pub fn render_run_spec(spec: &RunSpecification, format: ConfigFormat) -> Result<String> {
    let rendered = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(spec)?,
        ConfigFormat::Yaml => serde_yaml::to_string(spec)
            .map_err(|e| EngineError::Specification(format!("cannot render YAML: {e}")))?,
        ConfigFormat::Toml => toml::to_string_pretty(spec)
            .map_err(|e| EngineError::Specification(format!("cannot render TOML: {e}")))?,
    };
    Ok(rendered)
}

fn strip_prefix(err: &EngineError) -> String {
    match err {
        EngineError::Specification(msg) => msg.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Starter specifications written by `agentry init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Template {
    /// One builder, nothing else.
    #[default]
    Minimal,
    /// All three phases with gated verification and run limits.
    Complete,
}

impl FromStr for Template {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "minimal" => Ok(Self::Minimal),
            "complete" => Ok(Self::Complete),
            other => Err(EngineError::Specification(format!(
                "unknown template {other} (expected minimal or complete)"
            ))),
        }
    }
}

impl Template {
    pub fn spec(self) -> RunSpecification {
        match self {
            Self::Minimal => minimal(),
            Self::Complete => complete(),
        }
    }

    pub fn render(self, format: ConfigFormat) -> Result<String> {
        render_run_spec(&self.spec(), format)
    }
}

fn minimal() -> RunSpecification {
    RunSpecification {
        project: ProjectSpec {
            name: "hello-service".to_string(),
            description: "A tiny HTTP service that answers /health".to_string(),
            version: None,
            tags: Vec::new(),
        },
        build: BuildPhase {
            goal: "Implement the service with a README".to_string(),
            agents: vec![AgentSpec::new(AgentRole::Builder, "gpt-4o-mini")
                .with_goal("Write the service and its documentation")],
            max_cost_usd: None,
            max_runtime_min: None,
        },
        verify: None,
        operate: None,
        constraints: Constraints {
            max_cost_usd: Some(1.0),
            max_runtime_min: Some(15.0),
            ..Constraints::default()
        },
        logging: LoggingSpec::default(),
    }
}

fn complete() -> RunSpecification {
    RunSpecification {
        project: ProjectSpec {
            name: "todo-api".to_string(),
            description: "REST API for a todo list with persistence".to_string(),
            version: Some("0.1.0".to_string()),
            tags: vec!["api".to_string(), "example".to_string()],
        },
        build: BuildPhase {
            goal: "Build a small, well-tested REST API".to_string(),
            agents: vec![
                AgentSpec::new(AgentRole::Builder, "gpt-4o")
                    .with_goal("Implement the HTTP handlers and storage layer"),
                AgentSpec::new(AgentRole::Builder, "gpt-4o-mini")
                    .with_goal("Write the unit tests and README"),
            ],
            max_cost_usd: Some(6.0),
            max_runtime_min: Some(20.0),
        },
        verify: Some(VerifyPhase {
            strategy: VerifyStrategy::Gated,
            agents: vec![AgentSpec::new(AgentRole::Verifier, "gpt-4o").with_count(2)],
            tests: vec![
                TestSpec {
                    test_type: "unit".to_string(),
                    path: Some("tests".to_string()),
                    command: Some("make test".to_string()),
                    timeout_secs: 300,
                },
                TestSpec {
                    test_type: "review".to_string(),
                    path: None,
                    command: None,
                    timeout_secs: 300,
                },
            ],
            thresholds: Thresholds {
                min_test_coverage: Some(80.0),
                max_critical_issues: Some(0),
            },
            timeout_secs: 600,
            max_cost_usd: Some(2.0),
            max_runtime_min: None,
        }),
        operate: Some(OperatePhase {
            runtime: "local".to_string(),
            agents: vec![AgentSpec::new(AgentRole::Operator, "gpt-4o-mini")],
            commands: Vec::new(),
            max_cost_usd: Some(1.0),
            max_runtime_min: None,
        }),
        constraints: Constraints {
            max_cost_usd: Some(10.0),
            max_runtime_min: Some(60.0),
            pause_on_warning: false,
            ..Constraints::default()
        },
        logging: LoggingSpec {
            additional_sinks: vec![SinkSpec::File {
                path: "logs/run.ndjson".into(),
            }],
            ..LoggingSpec::default()
        },
    }
}
