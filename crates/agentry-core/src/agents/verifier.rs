//! Verifier agent: runs its assigned tests against the build artifact and
//! publishes a single `verify.report`.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{dispatch_messages, truncate, Agent, AgentAssignment, AgentContext, AgentError};
use crate::backend::parse_json_block;
use crate::domain::{
    kinds, EngineError, Event, OutcomeMetrics, TestSpec, VerificationOutcome,
};

const SYSTEM_PROMPT: &str = "You are a meticulous QA engineer. Assess code strictly and \
answer only with the requested JSON.";

const MAX_EXCERPT: usize = 4_000;

/// Test type used when no tests are configured for the phase.
pub const REVIEW_TEST_TYPE: &str = "review";

/// Backend-assessed review of the whole artifact.
pub fn review_test() -> TestSpec {
    TestSpec {
        test_type: REVIEW_TEST_TYPE.to_string(),
        path: None,
        command: None,
        timeout_secs: 300,
    }
}

static COVERAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)coverage\s*[:=]\s*([0-9]+(?:\.[0-9]+)?)\s*%?").expect("coverage pattern")
});

static CRITICAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)critical[ _-]issues?\s*[:=]\s*([0-9]+)").expect("critical issues pattern")
});

fn last_capture<T: std::str::FromStr>(re: &Regex, text: &str) -> Option<T> {
    re.captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Extract `coverage: N` and `critical issues: N` from command output.
/// The last occurrence wins, matching tools that print a summary at the end.
pub fn parse_metrics(output: &str) -> OutcomeMetrics {
    OutcomeMetrics {
        coverage: last_capture(&COVERAGE_RE, output),
        critical_issues: last_capture(&CRITICAL_RE, output),
        extra: Default::default(),
    }
}

#[derive(Debug, Deserialize)]
struct Assessment {
    passed: bool,
    #[serde(default)]
    coverage: Option<f64>,
    #[serde(default)]
    critical_issues: Option<u32>,
    #[serde(default)]
    detail: Option<String>,
}

pub struct VerifierAgent {
    assignment: AgentAssignment,
    outcomes: Vec<VerificationOutcome>,
}

impl VerifierAgent {
    pub fn new(assignment: AgentAssignment) -> Self {
        Self {
            assignment,
            outcomes: Vec::new(),
        }
    }

    async fn run_test(
        &mut self,
        ctx: &mut AgentContext,
        test: &TestSpec,
    ) -> Result<VerificationOutcome, AgentError> {
        match &test.command {
            Some(command) => self.run_command_test(ctx, test, command).await,
            None => self.assess(ctx, test).await,
        }
    }

    async fn run_command_test(
        &mut self,
        ctx: &mut AgentContext,
        test: &TestSpec,
        command: &str,
    ) -> Result<VerificationOutcome, AgentError> {
        let timeout = Duration::from_secs(test.timeout_secs);
        match ctx.run_command(command, timeout).await {
            Ok(output) => {
                let mut metrics = parse_metrics(&output.combined());
                metrics
                    .extra
                    .insert("exit_code".to_string(), json!(output.exit_code));
                Ok(VerificationOutcome {
                    test_type: test.test_type.clone(),
                    passed: output.success(),
                    metrics,
                    detail: (!output.success())
                        .then(|| truncate(&output.combined(), MAX_EXCERPT).to_string()),
                })
            }
            Err(AgentError::Engine(EngineError::Executor(err))) => {
                Ok(VerificationOutcome::failed(&test.test_type, err.to_string()))
            }
            Err(other) => Err(other),
        }
    }

    async fn assess(
        &mut self,
        ctx: &mut AgentContext,
        test: &TestSpec,
    ) -> Result<VerificationOutcome, AgentError> {
        let mut listing = String::new();
        if let Some(artifact) = &self.assignment.artifact {
            for file in &artifact.files {
                let content = match ctx.read_file(&file.path).await {
                    Ok(content) => content,
                    Err(AgentError::Engine(_)) => String::new(),
                    Err(other) => return Err(other),
                };
                listing.push_str(&format!(
                    "--- {}\n{}\n",
                    file.path,
                    truncate(&content, MAX_EXCERPT)
                ));
            }
        }
        let target = test.path.as_deref().unwrap_or("the whole project");
        let prompt = format!(
            "Goal: {}\nPerform a {} assessment of {target}.\n\n{listing}\n\
Respond with a JSON object with keys \"passed\" (bool), \"coverage\" (estimated test \
coverage percentage), \"critical_issues\" (count) and \"detail\" (short summary).",
            self.assignment.phase_goal, test.test_type
        );

        let completion = match ctx.complete(prompt, Some(SYSTEM_PROMPT.to_string())).await {
            Ok(completion) => completion,
            Err(AgentError::Engine(EngineError::Backend(err))) => {
                return Ok(VerificationOutcome::failed(&test.test_type, err.to_string()))
            }
            Err(other) => return Err(other),
        };
        Ok(match parse_json_block::<Assessment>(&completion.text) {
            Ok(a) => VerificationOutcome {
                test_type: test.test_type.clone(),
                passed: a.passed,
                metrics: OutcomeMetrics {
                    coverage: a.coverage,
                    critical_issues: a.critical_issues,
                    extra: Default::default(),
                },
                detail: a.detail,
            },
            Err(err) => VerificationOutcome::failed(&test.test_type, err.to_string()),
        })
    }
}

#[async_trait]
impl Agent for VerifierAgent {
    async fn start(&mut self, ctx: &mut AgentContext) -> Result<serde_json::Value, AgentError> {
        let artifact_id = self
            .assignment
            .artifact
            .as_ref()
            .map(|a| a.artifact_id.clone());
        let tests = self.assignment.tests.clone();

        for test in &tests {
            dispatch_messages(self, ctx).await?;
            let outcome = self.run_test(ctx, test).await?;
            let event_type = if outcome.passed {
                kinds::VERIFY_TEST_PASSED
            } else {
                kinds::VERIFY_TEST_FAILED
            };
            ctx.publish(event_type, json!({ "test_type": test.test_type, "outcome": outcome }))
                .await?;
            self.outcomes.push(outcome);
        }

        let passed = self.outcomes.iter().filter(|o| o.passed).count();
        info!(tests = self.outcomes.len(), passed, "verification finished");
        ctx.publish(
            kinds::VERIFY_REPORT,
            json!({ "artifact_id": artifact_id, "outcomes": self.outcomes }),
        )
        .await?;
        Ok(json!({ "tests": self.outcomes.len(), "passed": passed }))
    }

    async fn handle_event(&mut self, _ctx: &mut AgentContext, event: Event) -> Result<(), AgentError> {
        debug!(event_type = %event.event_type, from = ?event.agent_id, "verifier ignoring message");
        Ok(())
    }

    fn cancel(&mut self) {
        debug!(reported = self.outcomes.len(), "verifier cancelled");
    }
}
