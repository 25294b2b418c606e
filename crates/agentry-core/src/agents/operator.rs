//! Operator agent: runs the configured operational commands, or writes a
//! runbook for the artifact when none are configured.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{dispatch_messages, truncate, Agent, AgentAssignment, AgentContext, AgentError};
use crate::backend::strip_fences;
use crate::domain::{kinds, EngineError, Event, ExecutorError};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_OUTPUT: usize = 2_000;

const SYSTEM_PROMPT: &str = "You are an experienced site reliability engineer. \
Write concise, actionable operational documentation in Markdown.";

pub struct OperatorAgent {
    assignment: AgentAssignment,
    actions: Vec<serde_json::Value>,
}

impl OperatorAgent {
    pub fn new(assignment: AgentAssignment) -> Self {
        Self {
            assignment,
            actions: Vec::new(),
        }
    }

    async fn run_commands(&mut self, ctx: &mut AgentContext) -> Result<usize, AgentError> {
        let mut failures = 0;
        for command in self.assignment.commands.clone() {
            dispatch_messages(self, ctx).await?;
            let action = match ctx.run_command(&command, COMMAND_TIMEOUT).await {
                Ok(output) => {
                    if !output.success() {
                        failures += 1;
                        warn!(command = %command, exit_code = output.exit_code, "operate command failed");
                    }
                    json!({
                        "action": "command",
                        "command": command,
                        "exit_code": output.exit_code,
                        "output": truncate(&output.combined(), MAX_OUTPUT),
                    })
                }
                Err(AgentError::Engine(EngineError::Executor(err))) => {
                    failures += 1;
                    json!({ "action": "command", "command": command, "error": err.to_string() })
                }
                Err(other) => return Err(other),
            };
            ctx.publish(kinds::OPERATE_ACTION, action.clone()).await?;
            self.actions.push(action);
        }
        Ok(failures)
    }

    async fn write_runbook(&mut self, ctx: &mut AgentContext) -> Result<(), AgentError> {
        let files = self
            .assignment
            .artifact
            .as_ref()
            .map(|a| {
                a.files
                    .iter()
                    .map(|f| format!("- {}", f.path))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        let project = self
            .assignment
            .project
            .as_ref()
            .map(|p| p.name.as_str())
            .unwrap_or("the project");
        let prompt = format!(
            "Write an operations runbook for {project}.\nGoal: {}\nFiles:\n{files}\n\n\
Cover deployment, monitoring, alerting and incident response.",
            self.assignment.phase_goal
        );

        let completion = ctx.complete(prompt, Some(SYSTEM_PROMPT.to_string())).await?;
        let path = format!("ops/{}-runbook.md", ctx.agent_id());
        let written = ctx
            .write_file(&path, strip_fences(&completion.text))
            .await?;
        let action = json!({ "action": "runbook", "path": written.path, "digest": written.digest });
        ctx.publish(kinds::OPERATE_ACTION, action.clone()).await?;
        self.actions.push(action);
        Ok(())
    }
}

#[async_trait]
impl Agent for OperatorAgent {
    async fn start(&mut self, ctx: &mut AgentContext) -> Result<serde_json::Value, AgentError> {
        let failures = if self.assignment.commands.is_empty() {
            self.write_runbook(ctx).await?;
            0
        } else {
            self.run_commands(ctx).await?
        };

        let summary = json!({ "actions": self.actions.len(), "failures": failures });
        ctx.publish(kinds::OPERATE_COMPLETED, summary.clone()).await?;
        info!(actions = self.actions.len(), failures, "operations finished");
        if failures > 0 {
            return Err(ExecutorError::Io(format!("{failures} operate command(s) failed")).into());
        }
        Ok(summary)
    }

    async fn handle_event(&mut self, _ctx: &mut AgentContext, event: Event) -> Result<(), AgentError> {
        debug!(event_type = %event.event_type, from = ?event.agent_id, "operator received message");
        Ok(())
    }

    fn cancel(&mut self) {
        debug!(actions = self.actions.len(), "operator cancelled");
    }
}
