//! Durable run state and its checkpoint store.
//!
//! [`FsdState`] has a single owner, the orchestrator, which mutates it after
//! each milestone attempt and QA pass. [`StatePersistence`] writes one JSON
//! checkpoint per project, bundling the state with the [`FsdConfig`] that
//! created it. Resume always re-reads the full file; last write wins.

use crate::config::FsdConfig;
use crate::errors::FsdError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// Where the run currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Planning,
    Executing,
    Qa,
    Paused,
    Complete,
    Failed,
}

/// Mutable state of one FSD run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsdState {
    pub mode: RunMode,
    pub current_milestone_id: Option<String>,
    /// Ordered: completion order is the resume order.
    pub completed_milestones: Vec<String>,
    pub skipped_milestones: Vec<String>,
    pub failed_attempts: u32,
    /// Monotonic non-decreasing.
    pub total_cost_usd: f64,
    /// Monotonic non-decreasing.
    pub total_prompts: u32,
    /// QA takeaways carried into later milestone prompts.
    pub learnings: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub agent_session_id: Option<String>,
    pub interactive_history: Vec<String>,
}

impl FsdState {
    pub fn new() -> Self {
        Self {
            mode: RunMode::Planning,
            current_milestone_id: None,
            completed_milestones: Vec::new(),
            skipped_milestones: Vec::new(),
            failed_attempts: 0,
            total_cost_usd: 0.0,
            total_prompts: 0,
            learnings: Vec::new(),
            start_time: Utc::now(),
            agent_session_id: None,
            interactive_history: Vec::new(),
        }
    }

    /// Fold one attempt's cost into the run totals.
    pub fn record_attempt(&mut self, cost_usd: f64) {
        self.total_cost_usd += cost_usd.max(0.0);
        self.total_prompts += 1;
    }

    pub fn elapsed_minutes(&self) -> i64 {
        (Utc::now() - self.start_time).num_minutes()
    }
}

impl Default for FsdState {
    fn default() -> Self {
        Self::new()
    }
}

/// One persisted checkpoint: state plus the config that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: FsdState,
    pub config: FsdConfig,
    pub saved_at: DateTime<Utc>,
}

/// Checkpoint store, one file per project.
pub struct StatePersistence {
    state_file: PathBuf,
}

impl StatePersistence {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    pub fn save(&self, state: &FsdState, config: &FsdConfig) -> Result<(), FsdError> {
        let checkpoint = Checkpoint {
            state: state.clone(),
            config: config.clone(),
            saved_at: Utc::now(),
        };
        if let Some(parent) = self.state_file.parent() {
            fs::create_dir_all(parent).map_err(|source| self.persistence_error(source))?;
        }
        let json = serde_json::to_string_pretty(&checkpoint)
            .map_err(|e| self.persistence_error(std::io::Error::other(e)))?;
        fs::write(&self.state_file, json).map_err(|source| self.persistence_error(source))?;
        Ok(())
    }

    fn persistence_error(&self, source: std::io::Error) -> FsdError {
        FsdError::Persistence {
            path: self.state_file.clone(),
            source,
        }
    }

    /// Load the persisted checkpoint, if any. A corrupt or unreadable file
    /// is treated as absent so a resume falls back to a fresh run.
    pub fn load(&self) -> Option<Checkpoint> {
        if !self.state_file.exists() {
            return None;
        }
        let content = match fs::read_to_string(&self.state_file) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %self.state_file.display(), error = %e, "unreadable checkpoint, starting fresh");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(path = %self.state_file.display(), error = %e, "corrupt checkpoint, starting fresh");
                None
            }
        }
    }

    pub fn exists(&self) -> bool {
        self.state_file.exists()
    }

    pub fn clear(&self) -> Result<(), FsdError> {
        if self.state_file.exists() {
            fs::remove_file(&self.state_file).map_err(|source| self.persistence_error(source))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &std::path::Path {
        &self.state_file
    }
}
