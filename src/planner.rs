//! Planning seam.
//!
//! Plan generation lives behind the [`Planner`] trait; the orchestrator
//! does not care whether milestones come from a remote planning API, an
//! agent pass, or a fixture. [`AgentPlanner`] asks the agent for a JSON
//! plan and is the default wiring in the CLI.

use crate::agent::{AgentInvoker, AgentRequest, extract_json_object};
use crate::output::OutputHandler;
use crate::plan::Plan;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, goal: &str, handler: &dyn OutputHandler) -> Result<Plan>;
}

/// Plans by asking the agent to decompose the goal into milestones.
pub struct AgentPlanner {
    agent: Arc<dyn AgentInvoker>,
}

impl AgentPlanner {
    pub fn new(agent: Arc<dyn AgentInvoker>) -> Self {
        Self { agent }
    }

    fn planning_prompt(goal: &str) -> String {
        format!(
            "Study this repository and break the following goal into 3-8 ordered \
             milestones with dependencies:\n{goal}\n\n\
             Answer with a single JSON object:\n\
             {{\"milestones\": [{{\"id\": \"m1\", \"title\": \"...\", \
             \"size\": \"small|medium|large\", \"depends_on\": []}}], \
             \"estimated_cost_usd\": 0.0, \"estimated_time_minutes\": 0, \
             \"risks\": []}}\n\
             Ids must be unique; depends_on may only reference earlier milestones."
        )
    }
}

#[async_trait]
impl Planner for AgentPlanner {
    async fn plan(&self, goal: &str, handler: &dyn OutputHandler) -> Result<Plan> {
        let outcome = self
            .agent
            .invoke(
                AgentRequest {
                    prompt: Self::planning_prompt(goal),
                    resume_session: None,
                },
                handler,
            )
            .await?;

        if outcome.is_error {
            bail!("planning agent reported an error");
        }
        let value = extract_json_object(&outcome.output)
            .context("planning agent returned no JSON plan")?;
        let plan: Plan =
            serde_json::from_value(value).context("planning agent returned a malformed plan")?;
        plan.validate()?;
        Ok(plan)
    }
}
