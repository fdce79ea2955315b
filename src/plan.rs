//! Milestone plan: the immutable dependency graph the run executes.
//!
//! Milestones run strictly sequentially. Selection respects the dependency
//! graph, with original plan order as the tie-break among eligible
//! milestones.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Rough size of a milestone, used by prompts and time estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SizeCategory {
    Small,
    #[default]
    Medium,
    Large,
}

/// A discrete unit of agent work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub size: SizeCategory,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// The plan produced by the planner at run start. Immutable for the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub estimated_cost_usd: f64,
    #[serde(default)]
    pub estimated_time_minutes: u32,
    #[serde(default)]
    pub risks: Vec<String>,
}

impl Plan {
    /// Reject plans with duplicate ids, unknown dependencies, or
    /// self-dependencies before the run starts.
    pub fn validate(&self) -> Result<()> {
        if self.milestones.is_empty() {
            bail!("plan contains no milestones");
        }
        let ids: HashSet<&str> = self.milestones.iter().map(|m| m.id.as_str()).collect();
        if ids.len() != self.milestones.len() {
            bail!("plan contains duplicate milestone ids");
        }
        for m in &self.milestones {
            for dep in &m.depends_on {
                if dep == &m.id {
                    bail!("milestone {} depends on itself", m.id);
                }
                if !ids.contains(dep.as_str()) {
                    bail!("milestone {} depends on unknown milestone {}", m.id, dep);
                }
            }
        }
        Ok(())
    }

    pub fn milestone(&self, id: &str) -> Option<&Milestone> {
        self.milestones.iter().find(|m| m.id == id)
    }

    pub fn ids(&self) -> HashSet<String> {
        self.milestones.iter().map(|m| m.id.clone()).collect()
    }

    /// The next milestone to run: first in plan order that is neither
    /// completed nor skipped and whose dependencies are all completed.
    /// Skipped milestones never satisfy a dependency.
    pub fn next_eligible(&self, completed: &[String], skipped: &[String]) -> Option<&Milestone> {
        self.milestones.iter().find(|m| {
            !completed.contains(&m.id)
                && !skipped.contains(&m.id)
                && m.depends_on.iter().all(|d| completed.contains(d))
        })
    }

    /// Milestones (still pending) that transitively depend on `id`.
    /// Drives the skip-vs-abort decision when an iteration budget runs out.
    pub fn pending_dependents(
        &self,
        id: &str,
        completed: &[String],
        skipped: &[String],
    ) -> Vec<&Milestone> {
        let mut blocked: HashSet<&str> = HashSet::new();
        blocked.insert(id);
        // Plan order is a valid traversal order because dependencies always
        // refer to earlier work; iterate until the frontier stops growing to
        // stay correct even for out-of-order plans.
        loop {
            let before = blocked.len();
            for m in &self.milestones {
                if m.depends_on.iter().any(|d| blocked.contains(d.as_str())) {
                    blocked.insert(m.id.as_str());
                }
            }
            if blocked.len() == before {
                break;
            }
        }
        self.milestones
            .iter()
            .filter(|m| {
                m.id != id
                    && blocked.contains(m.id.as_str())
                    && !completed.contains(&m.id)
                    && !skipped.contains(&m.id)
            })
            .collect()
    }

    /// True when every milestone is completed or skipped.
    pub fn is_finished(&self, completed: &[String], skipped: &[String]) -> bool {
        self.milestones
            .iter()
            .all(|m| completed.contains(&m.id) || skipped.contains(&m.id))
    }
}
