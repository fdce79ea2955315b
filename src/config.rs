//! Run configuration and on-disk layout.
//!
//! [`FsdConfig`] is supplied at run start and immutable for the run; it is
//! also embedded in the checkpoint so a resumed run keeps the budgets it
//! started with. [`RunPaths`] centralizes every path under the project's
//! `.fsd/` directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Budgets and behavior switches for one run. Immutable once the run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsdConfig {
    /// Hard ceiling on cumulative model cost.
    pub max_cost_usd: f64,
    /// Attempts allowed per milestone, QA retries included.
    pub max_iterations_per_milestone: u32,
    /// Hard ceiling on total agent invocations for the run.
    pub max_total_prompts: u32,
    /// Persist a checkpoint every N completed milestones.
    pub checkpoint_interval: u32,
    /// Ask for confirmation before starting each milestone.
    pub sensitive_approval: bool,
    /// Resume from a persisted checkpoint without an explicit --resume.
    pub auto_resume: bool,
    /// Skip the QA review pass entirely.
    pub skip_qa: bool,
}

impl Default for FsdConfig {
    fn default() -> Self {
        Self {
            max_cost_usd: 10.0,
            max_iterations_per_milestone: 3,
            max_total_prompts: 50,
            checkpoint_interval: 1,
            sensitive_approval: false,
            auto_resume: false,
            skip_qa: false,
        }
    }
}

/// Filesystem layout for a project's FSD run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub project_dir: PathBuf,
    pub fsd_dir: PathBuf,
    pub state_file: PathBuf,
    pub plan_file: PathBuf,
    pub log_dir: PathBuf,
    pub qa_dir: PathBuf,
    pub summary_file: PathBuf,
    /// Agent command, overridable via FSD_AGENT_CMD.
    pub agent_cmd: String,
}

impl RunPaths {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let fsd_dir = project_dir.join(".fsd");
        let agent_cmd = std::env::var("FSD_AGENT_CMD").unwrap_or_else(|_| "claude".to_string());
        Ok(Self {
            state_file: fsd_dir.join("fsd-state.json"),
            plan_file: fsd_dir.join("plan.json"),
            log_dir: fsd_dir.join("logs"),
            qa_dir: fsd_dir.join("qa"),
            summary_file: fsd_dir.join("session-summary.md"),
            project_dir,
            fsd_dir,
            agent_cmd,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.qa_dir).context("Failed to create qa directory")?;
        Ok(())
    }

    pub fn prompt_file(&self, milestone: &str, iteration: u32) -> PathBuf {
        self.log_dir
            .join(format!("milestone-{milestone}-iter-{iteration}-prompt.md"))
    }

    pub fn output_file(&self, milestone: &str, iteration: u32) -> PathBuf {
        self.log_dir
            .join(format!("milestone-{milestone}-iter-{iteration}-output.log"))
    }
}
