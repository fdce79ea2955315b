//! Typed error hierarchy for the FSD orchestrator.
//!
//! Fatal conditions (budget, planning, git protection, an unskippable
//! milestone running out of iterations) abort the run with a non-zero
//! outcome. Execution and QA failures are recoverable inside the retry
//! loop; persistence failures on save are logged and skipped.

use thiserror::Error;

/// Errors surfaced by the FSD run loop.
#[derive(Debug, Error)]
pub enum FsdError {
    #[error(
        "Budget exceeded: ${total_cost_usd:.2} spent across {total_prompts} prompts (limit ${max_cost_usd:.2} / {max_total_prompts} prompts)"
    )]
    BudgetExceeded {
        total_cost_usd: f64,
        total_prompts: u32,
        max_cost_usd: f64,
        max_total_prompts: u32,
    },

    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Git protection failed: {0}")]
    GitProtection(String),

    #[error("Milestone {milestone} failed: {message}")]
    MilestoneExecution { milestone: String, message: String },

    #[error("Milestone {milestone} exhausted its iteration budget ({iterations} attempts) and other milestones depend on it")]
    MilestoneExhausted { milestone: String, iterations: u32 },

    #[error("QA review of milestone {milestone} failed: {message}")]
    Qa { milestone: String, message: String },

    #[error("Checkpoint persistence failed at {path}: {source}")]
    Persistence {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FsdError {
    /// Whether this error terminates the run immediately, as opposed to
    /// being retried under the per-milestone iteration budget.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FsdError::BudgetExceeded { .. }
                | FsdError::Planning(_)
                | FsdError::GitProtection(_)
                | FsdError::MilestoneExhausted { .. }
        )
    }
}
