//! Runs one milestone attempt through the agent.
//!
//! The executor is deliberately stateless across attempts: the
//! orchestrator owns retries, budgets, and what goes into the next prompt.
//! Each attempt's prompt and output are written (redacted) under
//! `.fsd/logs/` for audit, mirroring the checkpoint layout.

use crate::agent::{AgentInvoker, AgentRequest};
use crate::billing::CostSnapshot;
use crate::config::RunPaths;
use crate::output::OutputHandler;
use crate::plan::{Milestone, SizeCategory};
use crate::redact::redact_secrets;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::warn;

/// Result of a single milestone attempt.
#[derive(Debug, Clone)]
pub struct MilestoneOutcome {
    pub success: bool,
    pub output: String,
    pub cost: CostSnapshot,
    pub session_id: Option<String>,
}

pub struct MilestoneExecutor {
    agent: Arc<dyn AgentInvoker>,
    paths: RunPaths,
    goal: String,
}

impl MilestoneExecutor {
    pub fn new(agent: Arc<dyn AgentInvoker>, paths: RunPaths, goal: String) -> Self {
        Self { agent, paths, goal }
    }

    /// Run exactly one attempt. Retrying is the orchestrator's call.
    pub async fn attempt(
        &self,
        milestone: &Milestone,
        iteration: u32,
        fix_prompt: Option<&str>,
        learnings: &[String],
        resume_session: Option<&str>,
        handler: &dyn OutputHandler,
    ) -> Result<MilestoneOutcome> {
        let prompt = self.build_prompt(milestone, fix_prompt, learnings);

        let prompt_file = self.paths.prompt_file(&milestone.id, iteration);
        std::fs::write(&prompt_file, redact_secrets(&prompt))
            .context("Failed to write prompt file")?;

        let outcome = self
            .agent
            .invoke(
                AgentRequest {
                    prompt,
                    resume_session: resume_session.map(str::to_string),
                },
                handler,
            )
            .await?;

        let output_file = self.paths.output_file(&milestone.id, iteration);
        if let Err(e) = std::fs::write(&output_file, redact_secrets(&outcome.output)) {
            warn!(path = %output_file.display(), error = %e, "could not write attempt output");
        }

        Ok(MilestoneOutcome {
            success: !outcome.is_error && outcome.exit_code == 0,
            output: outcome.output,
            cost: outcome.cost,
            session_id: outcome.session_id,
        })
    }

    fn build_prompt(
        &self,
        milestone: &Milestone,
        fix_prompt: Option<&str>,
        learnings: &[String],
    ) -> String {
        let size_hint = match milestone.size {
            SizeCategory::Small => "a small, contained change",
            SizeCategory::Medium => "a moderate amount of work",
            SizeCategory::Large => "a substantial piece of work",
        };

        let mut prompt = format!(
            "You are building toward this goal:\n{}\n\n\
             ## CURRENT MILESTONE\n{} — {} (expect {size_hint})\n",
            self.goal, milestone.id, milestone.title
        );

        if !learnings.is_empty() {
            prompt.push_str("\n## LEARNINGS FROM EARLIER MILESTONES\n");
            for learning in learnings {
                prompt.push_str(&format!("- {learning}\n"));
            }
        }

        if let Some(fix) = fix_prompt {
            prompt.push_str(&format!("\n## REQUIRED FIXES\n{fix}\n"));
        }

        prompt.push_str(
            "\n## RULES\n\
             1. Implement only this milestone; do not start later ones.\n\
             2. Verify your work with the project's build and tests.\n\
             3. Finish with a short report of what changed and how it was verified.\n",
        );
        prompt
    }
}
