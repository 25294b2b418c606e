//! Builder agent: plans a handful of files, generates and writes each one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{dispatch_messages, Agent, AgentAssignment, AgentContext, AgentError};
use crate::backend::{parse_json_block, strip_fences};
use crate::domain::{kinds, ArtifactFile, BackendError, EngineError, Event};

const MIN_PLANNED_FILES: usize = 3;
const MAX_PLANNED_FILES: usize = 5;

const SYSTEM_PROMPT: &str = "You are a senior software engineer on a small team. \
Answer with exactly what is asked for and nothing else.";

/// One planned file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedFile {
    pub file_path: String,
    #[serde(default)]
    pub description: String,
}

pub struct BuilderAgent {
    assignment: AgentAssignment,
    notes: Vec<String>,
    written: Vec<ArtifactFile>,
    failed: Vec<String>,
}

impl BuilderAgent {
    pub fn new(assignment: AgentAssignment) -> Self {
        Self {
            assignment,
            notes: Vec::new(),
            written: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn goal_section(&self, ctx: &AgentContext) -> String {
        let mut out = String::new();
        if let Some(project) = &self.assignment.project {
            out.push_str(&format!("Project: {}\n", project.name));
            if !project.description.is_empty() {
                out.push_str(&format!("Description: {}\n", project.description));
            }
        }
        if !self.assignment.phase_goal.is_empty() {
            out.push_str(&format!("Team goal: {}\n", self.assignment.phase_goal));
        }
        if !ctx.spec().goal.is_empty() {
            out.push_str(&format!("Your goal: {}\n", ctx.spec().goal));
        }
        for note in &self.notes {
            out.push_str(&format!("Note from the team: {note}\n"));
        }
        out
    }

    fn plan_prompt(&self, ctx: &AgentContext) -> String {
        format!(
            "{}\nPlan the implementation as {MIN_PLANNED_FILES} to {MAX_PLANNED_FILES} files. \
Respond with a JSON array of objects with keys \"file_path\" (relative path) and \
\"description\".",
            self.goal_section(ctx)
        )
    }

    fn file_prompt(&self, ctx: &AgentContext, file: &PlannedFile, plan: &[PlannedFile]) -> String {
        let listing: Vec<String> = plan
            .iter()
            .map(|f| format!("- {}: {}", f.file_path, f.description))
            .collect();
        format!(
            "{}\nPlanned files:\n{}\n\nWrite the complete contents of {} ({}). \
Respond with the file contents only.",
            self.goal_section(ctx),
            listing.join("\n"),
            file.file_path,
            file.description
        )
    }

    async fn plan(&mut self, ctx: &mut AgentContext) -> Result<Vec<PlannedFile>, AgentError> {
        let prompt = self.plan_prompt(ctx);
        let completion = ctx.complete(prompt, Some(SYSTEM_PROMPT.to_string())).await?;
        let mut plan: Vec<PlannedFile> = parse_json_block(&completion.text)?;
        plan.retain(|f| !f.file_path.trim().is_empty());
        if plan.is_empty() {
            return Err(BackendError::Decode("build plan is empty".to_string()).into());
        }
        if plan.len() > MAX_PLANNED_FILES {
            debug!(planned = plan.len(), "truncating build plan");
            plan.truncate(MAX_PLANNED_FILES);
        }
        Ok(plan)
    }

    async fn build(&mut self, ctx: &mut AgentContext) -> Result<serde_json::Value, AgentError> {
        let plan = self.plan(ctx).await?;
        info!(files = plan.len(), "build plan ready");
        let mut last_error = None;

        for (idx, file) in plan.iter().enumerate() {
            dispatch_messages(self, ctx).await?;
            let step = idx + 1;
            ctx.publish(
                kinds::BUILD_STEP_START,
                json!({ "step": step, "file_path": file.file_path, "description": file.description }),
            )
            .await?;

            let prompt = self.file_prompt(ctx, file, &plan);
            let result = match ctx.complete(prompt, Some(SYSTEM_PROMPT.to_string())).await {
                Ok(completion) => {
                    let content = strip_fences(&completion.text).to_string();
                    ctx.write_file(&file.file_path, &content).await
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(written) => {
                    ctx.publish(
                        kinds::BUILD_STEP_COMPLETED,
                        json!({
                            "step": step,
                            "file_path": written.path,
                            "digest": written.digest,
                        }),
                    )
                    .await?;
                    self.written.push(written);
                }
                Err(AgentError::Engine(err)) if !matches!(err, EngineError::BusClosed) => {
                    warn!(file_path = %file.file_path, error = %err, "build step failed");
                    ctx.publish(
                        kinds::BUILD_STEP_FAILED,
                        json!({ "step": step, "file_path": file.file_path, "error": err.to_string() }),
                    )
                    .await?;
                    self.failed.push(file.file_path.clone());
                    last_error = Some(err);
                }
                Err(other) => return Err(other),
            }
        }

        if self.written.is_empty() {
            let err = last_error
                .unwrap_or_else(|| BackendError::Decode("no files were written".into()).into());
            return Err(err.into());
        }
        let files: Vec<&str> = self.written.iter().map(|f| f.path.as_str()).collect();
        let summary = json!({ "files": files, "failed": self.failed });
        ctx.publish(kinds::BUILD_COMPLETED, summary.clone()).await?;
        Ok(summary)
    }
}

#[async_trait]
impl Agent for BuilderAgent {
    async fn start(&mut self, ctx: &mut AgentContext) -> Result<serde_json::Value, AgentError> {
        match self.build(ctx).await {
            Err(AgentError::Engine(err)) if !matches!(err, EngineError::BusClosed) => {
                let _ = ctx
                    .publish(
                        kinds::BUILD_FAILED,
                        json!({ "error": err.to_string(), "failed": self.failed }),
                    )
                    .await;
                Err(AgentError::Engine(err))
            }
            other => other,
        }
    }

    async fn handle_event(&mut self, _ctx: &mut AgentContext, event: Event) -> Result<(), AgentError> {
        if let Some(note) = event.payload_str("note").or_else(|| event.payload_str("message")) {
            debug!(from = ?event.agent_id, "builder received note");
            self.notes.push(note.to_string());
        }
        Ok(())
    }

    fn cancel(&mut self) {
        debug!(written = self.written.len(), "builder cancelled");
    }
}
