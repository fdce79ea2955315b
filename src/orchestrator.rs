//! The run loop: a resumable state machine over the milestone plan.
//!
//! Planning → Executing → (QA ↔ retry) → Checkpointing, until every
//! milestone is completed or validly skipped. Budgets are enforced before
//! each agent invocation; pause is honored at milestone and QA boundaries;
//! state is checkpointed at the configured interval and whenever a pause
//! is observed. The git guard wraps the whole session.

use crate::billing::{BillingConfig, calculate_charge};
use crate::config::{FsdConfig, RunPaths};
use crate::errors::FsdError;
use crate::executor::MilestoneExecutor;
use crate::guard::GitProtection;
use crate::output::{OutputHandler, RunSummary};
use crate::pause::PauseController;
use crate::plan::Plan;
use crate::planner::Planner;
use crate::qa::QaReviewer;
use crate::redact::redact_secrets;
use crate::state::{FsdState, RunMode, StatePersistence};
use anyhow::anyhow;
use std::sync::Arc;
use tracing::{debug, warn};

/// What to do when a milestone exhausts its iteration budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionDecision {
    /// Nothing pending depends on it; mark it skipped and continue.
    Skip,
    /// Pending milestones depend on it; the run cannot meaningfully go on.
    Abort,
}

/// Skip a leaf milestone, abort when pending work depends on it.
pub fn exhaustion_policy(
    plan: &Plan,
    milestone_id: &str,
    completed: &[String],
    skipped: &[String],
) -> ExhaustionDecision {
    if plan
        .pending_dependents(milestone_id, completed, skipped)
        .is_empty()
    {
        ExhaustionDecision::Skip
    } else {
        ExhaustionDecision::Abort
    }
}

pub struct FsdOrchestrator {
    config: FsdConfig,
    billing: BillingConfig,
    paths: RunPaths,
    planner: Arc<dyn Planner>,
    executor: MilestoneExecutor,
    qa: QaReviewer,
    guard: Box<dyn GitProtection>,
    persistence: StatePersistence,
    pause: Arc<PauseController>,
    handler: Arc<dyn OutputHandler>,
    state: FsdState,
    plan: Option<Plan>,
}

impl FsdOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: FsdConfig,
        billing: BillingConfig,
        paths: RunPaths,
        planner: Arc<dyn Planner>,
        executor: MilestoneExecutor,
        qa: QaReviewer,
        guard: Box<dyn GitProtection>,
        pause: Arc<PauseController>,
        handler: Arc<dyn OutputHandler>,
    ) -> Self {
        let persistence = StatePersistence::new(paths.state_file.clone());
        Self {
            config,
            billing,
            paths,
            planner,
            executor,
            qa,
            guard,
            persistence,
            pause,
            handler,
            state: FsdState::new(),
            plan: None,
        }
    }

    pub fn state(&self) -> &FsdState {
        &self.state
    }

    /// Drive the run to a terminal state.
    pub async fn run(&mut self, goal: &str, resume_requested: bool) -> Result<RunSummary, FsdError> {
        self.handler.start(goal);
        self.state.interactive_history.push(format!("goal: {goal}"));

        let branch = match self.guard.protect() {
            Ok(branch) => branch,
            Err(e) => {
                let err = FsdError::GitProtection(e.to_string());
                self.fail(&err);
                return Err(err);
            }
        };
        self.handler.git_branch(&branch);
        self.handler
            .security_status("pushes are blocked for the duration of the session");

        self.try_resume(resume_requested);
        let plan = match self.plan.clone() {
            Some(plan) => plan,
            None => match self.generate_plan(goal).await {
                Ok(plan) => plan,
                Err(err) => {
                    self.fail(&err);
                    return Err(err);
                }
            },
        };

        self.state.mode = RunMode::Executing;
        let total = plan.milestones.len();

        loop {
            self.pause_boundary().await;

            let Some(milestone) = plan
                .next_eligible(&self.state.completed_milestones, &self.state.skipped_milestones)
                .cloned()
            else {
                break;
            };

            let done = self.state.completed_milestones.len() + self.state.skipped_milestones.len();
            self.handler.milestone_start(&milestone, done + 1, total);

            if self.config.sensitive_approval {
                let question = format!("Start milestone {} ({})?", milestone.id, milestone.title);
                self.state.interactive_history.push(question.clone());
                if !self.handler.confirm(&question) {
                    let err = FsdError::Other(anyhow!(
                        "milestone {} declined at approval gate",
                        milestone.id
                    ));
                    self.fail(&err);
                    return Err(err);
                }
            }

            // Dependency invariant: next_eligible only returns milestones
            // whose depends_on are all completed.
            self.state.current_milestone_id = Some(milestone.id.clone());

            let mut fix_prompt: Option<String> = None;
            let mut passed = false;
            let mut last_failure = String::from("no attempt executed");

            for iteration in 1..=self.config.max_iterations_per_milestone {
                self.pause_boundary().await;

                if let Some(err) = self.over_budget() {
                    self.fail(&err);
                    return Err(err);
                }

                let outcome = match self
                    .executor
                    .attempt(
                        &milestone,
                        iteration,
                        fix_prompt.as_deref(),
                        &self.state.learnings,
                        self.state.agent_session_id.as_deref(),
                        &*self.handler,
                    )
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let err = FsdError::MilestoneExecution {
                            milestone: milestone.id.clone(),
                            message: e.to_string(),
                        };
                        warn!(iteration, error = %err, "attempt failed to run");
                        last_failure = err.to_string();
                        continue;
                    }
                };

                let charge = calculate_charge(&outcome.cost, &self.billing);
                self.state.record_attempt(charge.actual_cost_usd);
                debug!(
                    milestone = %milestone.id,
                    iteration,
                    cost_usd = charge.actual_cost_usd,
                    credits = charge.charged_credits,
                    "attempt billed"
                );
                if let Some(session) = outcome.session_id.clone() {
                    self.state.agent_session_id = Some(session);
                }

                if !outcome.success {
                    last_failure = "agent reported an error for this attempt".to_string();
                    continue;
                }

                if self.config.skip_qa {
                    passed = true;
                    break;
                }

                self.state.mode = RunMode::Qa;
                self.handler.qa_start(&milestone);
                let report = match self.qa.review(&milestone, &outcome.output, &*self.handler).await
                {
                    Ok(report) => report,
                    Err(e) => {
                        let err = FsdError::Qa {
                            milestone: milestone.id.clone(),
                            message: e.to_string(),
                        };
                        warn!(iteration, error = %err, "QA pass failed to run");
                        self.state.mode = RunMode::Executing;
                        last_failure = err.to_string();
                        continue;
                    }
                };
                if let Err(e) = self.qa.save_report(&milestone.id, iteration, &report) {
                    warn!(milestone = %milestone.id, error = %e, "could not save QA report");
                }
                self.handler.qa_complete(&milestone, report.passed);
                self.state.mode = RunMode::Executing;

                if report.passed {
                    passed = true;
                    break;
                }

                for issue in &report.issues {
                    self.handler.qa_issue(issue);
                    self.state
                        .learnings
                        .push(format!("{}: {}", milestone.id, redact_secrets(&issue.description)));
                }
                let fix = self.qa.fix_prompt(&milestone, &report.issues);
                self.state.interactive_history.push(fix.clone());
                fix_prompt = Some(fix);
                last_failure = format!("QA found {} issue(s)", report.issues.len());
            }

            self.state.current_milestone_id = None;

            if passed {
                self.state.completed_milestones.push(milestone.id.clone());
                self.handler.milestone_complete(&milestone);
                let completed = self.state.completed_milestones.len() as u32;
                if completed % self.config.checkpoint_interval.max(1) == 0 {
                    self.checkpoint();
                }
                continue;
            }

            self.state.failed_attempts += 1;
            self.handler.milestone_failed(&milestone, &last_failure);
            match exhaustion_policy(
                &plan,
                &milestone.id,
                &self.state.completed_milestones,
                &self.state.skipped_milestones,
            ) {
                ExhaustionDecision::Skip => {
                    self.state.skipped_milestones.push(milestone.id.clone());
                    self.handler.milestone_skipped(&milestone);
                    self.checkpoint();
                }
                ExhaustionDecision::Abort => {
                    let blockers: Vec<String> = plan
                        .pending_dependents(
                            &milestone.id,
                            &self.state.completed_milestones,
                            &self.state.skipped_milestones,
                        )
                        .iter()
                        .map(|m| format!("{} waits on {}", m.id, milestone.id))
                        .collect();
                    self.handler.show_blockers(&blockers);
                    let err = FsdError::MilestoneExhausted {
                        milestone: milestone.id.clone(),
                        iterations: self.config.max_iterations_per_milestone,
                    };
                    self.fail(&err);
                    return Err(err);
                }
            }
        }

        if !plan.is_finished(&self.state.completed_milestones, &self.state.skipped_milestones) {
            // Unreachable under the skip policy, but a resumed run against a
            // mismatched plan could stall here.
            let blockers: Vec<String> = plan
                .milestones
                .iter()
                .filter(|m| {
                    !self.state.completed_milestones.contains(&m.id)
                        && !self.state.skipped_milestones.contains(&m.id)
                })
                .map(|m| format!("{} has unmet dependencies", m.id))
                .collect();
            self.handler.show_blockers(&blockers);
            let err = FsdError::Other(anyhow!("no eligible milestone remains"));
            self.fail(&err);
            return Err(err);
        }

        self.state.mode = RunMode::Complete;
        let summary = self.summary();
        if let Err(e) = self
            .guard
            .finalize(&summary, &self.state.completed_milestones)
        {
            warn!(error = %e, "could not finalize git session");
        }
        if let Some(branch) = self.guard.branch_name() {
            self.handler.git_complete(branch);
        }
        if let Err(e) = self.persistence.clear() {
            warn!(error = %e, "could not clear checkpoint");
        }
        self.handler.complete(&summary);
        Ok(summary)
    }

    async fn generate_plan(&mut self, goal: &str) -> Result<Plan, FsdError> {
        self.state.mode = RunMode::Planning;
        self.handler.planning_start();
        let plan = self
            .planner
            .plan(goal, &*self.handler)
            .await
            .map_err(|e| FsdError::Planning(e.to_string()))?;
        plan.validate().map_err(|e| FsdError::Planning(e.to_string()))?;

        match serde_json::to_string_pretty(&plan) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.paths.plan_file, json) {
                    warn!(path = %self.paths.plan_file.display(), error = %e, "could not persist plan");
                }
            }
            Err(e) => warn!(error = %e, "could not serialize plan"),
        }

        self.handler.planning_complete(&plan);
        self.handler.show_plan(&plan);
        self.plan = Some(plan.clone());
        Ok(plan)
    }

    /// Reconstruct state from a persisted checkpoint when asked to. The
    /// persisted completed set must be a subset of the saved plan's ids;
    /// any mismatch falls back to a fresh run.
    fn try_resume(&mut self, requested: bool) -> bool {
        if !(requested || self.config.auto_resume) {
            return false;
        }
        let Some(checkpoint) = self.persistence.load() else {
            return false;
        };
        let plan: Option<Plan> = std::fs::read_to_string(&self.paths.plan_file)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok());
        let Some(plan) = plan else {
            warn!("checkpoint exists but plan is missing; starting fresh");
            return false;
        };
        let ids = plan.ids();
        if !checkpoint
            .state
            .completed_milestones
            .iter()
            .all(|id| ids.contains(id))
        {
            warn!("checkpoint does not match the current plan; starting fresh");
            return false;
        }

        debug!(
            completed = checkpoint.state.completed_milestones.len(),
            cost_usd = checkpoint.state.total_cost_usd,
            "resuming from checkpoint"
        );
        // The budgets the run started with stay in force across resumes.
        self.config = checkpoint.config.clone();
        self.state = checkpoint.state;
        self.state.mode = RunMode::Executing;
        self.plan = Some(plan);
        true
    }

    /// Honor a pause observed at a safe boundary: persist, report, and
    /// suspend until resumed.
    async fn pause_boundary(&mut self) {
        if self.pause.is_paused() {
            let previous = self.state.mode;
            self.state.mode = RunMode::Paused;
            self.checkpoint();
            self.handler.progress("paused — waiting for resume");
            self.pause.wait_if_paused().await;
            self.state.mode = if previous == RunMode::Paused {
                RunMode::Executing
            } else {
                previous
            };
        } else {
            self.pause.wait_if_paused().await;
        }
    }

    fn over_budget(&self) -> Option<FsdError> {
        if self.state.total_cost_usd >= self.config.max_cost_usd
            || self.state.total_prompts >= self.config.max_total_prompts
        {
            Some(FsdError::BudgetExceeded {
                total_cost_usd: self.state.total_cost_usd,
                total_prompts: self.state.total_prompts,
                max_cost_usd: self.config.max_cost_usd,
                max_total_prompts: self.config.max_total_prompts,
            })
        } else {
            None
        }
    }

    /// Save-failures are logged and the run continues without that
    /// checkpoint.
    fn checkpoint(&self) {
        if let Err(e) = self.persistence.save(&self.state, &self.config) {
            warn!(error = %e, "could not write checkpoint");
        }
    }

    /// Terminal failure: mark the state, leave the checkpoint on disk for a
    /// later resume, and surface the error.
    fn fail(&mut self, err: &FsdError) {
        self.state.mode = RunMode::Failed;
        self.checkpoint();
        self.handler.error(&err.to_string());
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            milestones_completed: self.state.completed_milestones.len(),
            milestones_skipped: self.state.skipped_milestones.len(),
            total_cost_usd: self.state.total_cost_usd,
            total_prompts: self.state.total_prompts,
            elapsed_minutes: self.state.elapsed_minutes(),
            failed_attempts: self.state.failed_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::fake::FakeAgent;
    use crate::billing::{BillingContext, BillingMode};
    use crate::guard::fake::FakeGuard;
    use crate::output::recording::RecordingHandler;
    use crate::plan::{Milestone, SizeCategory};
    use crate::planner::fake::FakePlanner;
    use crate::state::StatePersistence;
    use tempfile::tempdir;

    const QA_PASS: &str = r#"{"passed": true, "issues": []}"#;
    const QA_FAIL: &str =
        r#"{"passed": false, "issues": [{"severity": "major", "description": "tests missing"}]}"#;

    fn milestone(id: &str, deps: &[&str]) -> Milestone {
        Milestone {
            id: id.to_string(),
            title: format!("Milestone {id}"),
            size: SizeCategory::Medium,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn two_step_plan() -> Plan {
        Plan {
            milestones: vec![milestone("m1", &[]), milestone("m2", &["m1"])],
            estimated_cost_usd: 1.0,
            estimated_time_minutes: 10,
            risks: vec![],
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        handler: Arc<RecordingHandler>,
        pause: Arc<PauseController>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dir: tempdir().unwrap(),
                handler: Arc::new(RecordingHandler::new()),
                pause: Arc::new(PauseController::new()),
            }
        }

        fn orchestrator(
            &self,
            config: FsdConfig,
            plan: Plan,
            outcomes: Vec<crate::agent::AgentOutcome>,
            guard: FakeGuard,
        ) -> FsdOrchestrator {
            let paths = RunPaths::new(self.dir.path().to_path_buf()).unwrap();
            paths.ensure_directories().unwrap();
            let agent: Arc<dyn crate::agent::AgentInvoker> = Arc::new(FakeAgent::new(outcomes));
            FsdOrchestrator::new(
                config,
                BillingConfig {
                    mode: BillingMode::Byok,
                    context: BillingContext::Cli,
                },
                paths.clone(),
                Arc::new(FakePlanner::ok(plan)),
                MilestoneExecutor::new(agent.clone(), paths.clone(), "test goal".to_string()),
                QaReviewer::new(agent, paths.qa_dir.clone(), String::new()),
                Box::new(guard),
                Arc::clone(&self.pause),
                self.handler.clone(),
            )
        }

        fn persistence(&self) -> StatePersistence {
            let paths = RunPaths::new(self.dir.path().to_path_buf()).unwrap();
            StatePersistence::new(paths.state_file)
        }
    }

    #[tokio::test]
    async fn happy_path_completes_all_milestones() {
        let h = Harness::new();
        let outcomes = vec![
            FakeAgent::success("m1 built", 0.10),
            FakeAgent::success(QA_PASS, 0.01),
            FakeAgent::success("m2 built", 0.10),
            FakeAgent::success(QA_PASS, 0.01),
        ];
        let mut orch = h.orchestrator(
            FsdConfig::default(),
            two_step_plan(),
            outcomes,
            FakeGuard::new(),
        );

        let summary = orch.run("build it", false).await.unwrap();
        assert_eq!(summary.milestones_completed, 2);
        assert_eq!(summary.milestones_skipped, 0);
        assert_eq!(summary.total_prompts, 2);
        assert!((summary.total_cost_usd - 0.20).abs() < 1e-9);

        assert_eq!(orch.state().mode, RunMode::Complete);
        assert_eq!(
            orch.state().completed_milestones,
            vec!["m1".to_string(), "m2".to_string()]
        );
        // Checkpoint removed after successful completion.
        assert!(!h.persistence().exists());

        let events = h.handler.events();
        assert!(events.contains(&"milestone_complete:m1".to_string()));
        assert!(events.contains(&"qa_complete:m2:true".to_string()));
        assert!(events.iter().any(|e| e.starts_with("complete:")));
    }

    #[tokio::test]
    async fn dependency_order_is_respected() {
        let h = Harness::new();
        let plan = Plan {
            milestones: vec![
                milestone("a", &[]),
                milestone("b", &["a"]),
                milestone("c", &["a", "b"]),
            ],
            estimated_cost_usd: 1.0,
            estimated_time_minutes: 10,
            risks: vec![],
        };
        let outcomes = (0..3)
            .flat_map(|_| {
                vec![
                    FakeAgent::success("built", 0.01),
                    FakeAgent::success(QA_PASS, 0.01),
                ]
            })
            .collect();
        let mut orch = h.orchestrator(FsdConfig::default(), plan, outcomes, FakeGuard::new());
        orch.run("build it", false).await.unwrap();

        let events = h.handler.events();
        let starts: Vec<&String> = events
            .iter()
            .filter(|e| e.starts_with("milestone_start:"))
            .collect();
        assert_eq!(starts, ["milestone_start:a", "milestone_start:b", "milestone_start:c"]);
    }

    #[tokio::test]
    async fn qa_failure_triggers_redacted_fix_retry() {
        let h = Harness::new();
        let outcomes = vec![
            FakeAgent::success("m1 attempt 1", 0.05),
            FakeAgent::success(QA_FAIL, 0.01),
            FakeAgent::success("m1 attempt 2", 0.05),
            FakeAgent::success(QA_PASS, 0.01),
        ];
        let plan = Plan {
            milestones: vec![milestone("m1", &[])],
            estimated_cost_usd: 0.5,
            estimated_time_minutes: 5,
            risks: vec![],
        };
        let mut orch = h.orchestrator(FsdConfig::default(), plan, outcomes, FakeGuard::new());
        let summary = orch.run("build it", false).await.unwrap();

        assert_eq!(summary.milestones_completed, 1);
        assert_eq!(summary.total_prompts, 2); // two milestone attempts billed
        assert!(orch.state().learnings.iter().any(|l| l.contains("tests missing")));

        let events = h.handler.events();
        assert!(events.contains(&"qa_complete:m1:false".to_string()));
        assert!(events.contains(&"qa_issue:tests missing".to_string()));
        assert!(events.contains(&"qa_complete:m1:true".to_string()));
    }

    #[tokio::test]
    async fn exhausted_leaf_milestone_is_skipped() {
        let h = Harness::new();
        let config = FsdConfig {
            max_iterations_per_milestone: 2,
            ..Default::default()
        };
        // m2 (a leaf) fails QA on both attempts; m1 passes.
        let outcomes = vec![
            FakeAgent::success("m1 built", 0.01),
            FakeAgent::success(QA_PASS, 0.01),
            FakeAgent::success("m2 try 1", 0.01),
            FakeAgent::success(QA_FAIL, 0.01),
            FakeAgent::success("m2 try 2", 0.01),
            FakeAgent::success(QA_FAIL, 0.01),
        ];
        let mut orch = h.orchestrator(config, two_step_plan(), outcomes, FakeGuard::new());
        let summary = orch.run("build it", false).await.unwrap();

        assert_eq!(summary.milestones_completed, 1);
        assert_eq!(summary.milestones_skipped, 1);
        assert_eq!(summary.failed_attempts, 1);
        assert_eq!(orch.state().mode, RunMode::Complete);
        assert!(h.handler.events().contains(&"milestone_skipped:m2".to_string()));
    }

    #[tokio::test]
    async fn exhausted_milestone_with_dependents_aborts() {
        let h = Harness::new();
        let config = FsdConfig {
            max_iterations_per_milestone: 1,
            ..Default::default()
        };
        // m1 fails QA; m2 depends on it.
        let outcomes = vec![
            FakeAgent::success("m1 try 1", 0.01),
            FakeAgent::success(QA_FAIL, 0.01),
        ];
        let mut orch = h.orchestrator(config, two_step_plan(), outcomes, FakeGuard::new());
        let err = orch.run("build it", false).await.unwrap_err();

        assert!(matches!(err, FsdError::MilestoneExhausted { .. }));
        assert_eq!(orch.state().mode, RunMode::Failed);
        // Checkpoint left on disk for a later resume.
        assert!(h.persistence().exists());
        assert!(h.handler.events().contains(&"blockers:1".to_string()));
    }

    #[tokio::test]
    async fn budget_stops_the_run_before_the_next_attempt() {
        let h = Harness::new();
        let config = FsdConfig {
            max_cost_usd: 0.10,
            skip_qa: true,
            ..Default::default()
        };
        // First attempt costs 0.12 and crosses the budget; the second
        // milestone must never start.
        let outcomes = vec![
            FakeAgent::success("m1 built", 0.12),
            FakeAgent::success("never reached", 0.12),
        ];
        let mut orch = h.orchestrator(config, two_step_plan(), outcomes, FakeGuard::new());
        let err = orch.run("build it", false).await.unwrap_err();

        assert!(matches!(err, FsdError::BudgetExceeded { .. }));
        // Overshoot is bounded by the single in-flight attempt.
        assert!((orch.state().total_cost_usd - 0.12).abs() < 1e-9);
        assert_eq!(orch.state().total_prompts, 1);
        assert_eq!(orch.state().completed_milestones, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn prompt_budget_is_enforced() {
        let h = Harness::new();
        let config = FsdConfig {
            max_total_prompts: 1,
            skip_qa: true,
            ..Default::default()
        };
        let outcomes = vec![
            FakeAgent::success("m1 built", 0.01),
            FakeAgent::success("never reached", 0.01),
        ];
        let mut orch = h.orchestrator(config, two_step_plan(), outcomes, FakeGuard::new());
        let err = orch.run("build it", false).await.unwrap_err();
        assert!(matches!(err, FsdError::BudgetExceeded { .. }));
        assert_eq!(orch.state().total_prompts, 1);
    }

    #[tokio::test]
    async fn git_protection_failure_aborts_before_any_milestone() {
        let h = Harness::new();
        let mut orch = h.orchestrator(
            FsdConfig::default(),
            two_step_plan(),
            vec![],
            FakeGuard::failing(),
        );
        let err = orch.run("build it", false).await.unwrap_err();
        assert!(matches!(err, FsdError::GitProtection(_)));
        // No agent was ever invoked.
        assert!(
            !h.handler
                .events()
                .iter()
                .any(|e| e.starts_with("milestone_start:"))
        );
    }

    #[tokio::test]
    async fn planning_failure_is_fatal() {
        let h = Harness::new();
        let paths = RunPaths::new(h.dir.path().to_path_buf()).unwrap();
        paths.ensure_directories().unwrap();
        let agent: Arc<dyn crate::agent::AgentInvoker> = Arc::new(FakeAgent::new(vec![]));
        let mut orch = FsdOrchestrator::new(
            FsdConfig::default(),
            BillingConfig {
                mode: BillingMode::Byok,
                context: BillingContext::Cli,
            },
            paths.clone(),
            Arc::new(FakePlanner::failing("interview service unavailable")),
            MilestoneExecutor::new(agent.clone(), paths.clone(), "goal".to_string()),
            QaReviewer::new(agent, paths.qa_dir.clone(), String::new()),
            Box::new(FakeGuard::new()),
            Arc::clone(&h.pause),
            h.handler.clone(),
        );
        let err = orch.run("build it", false).await.unwrap_err();
        assert!(matches!(err, FsdError::Planning(_)));
        assert!(
            h.handler
                .events()
                .iter()
                .any(|e| e.starts_with("error:Planning failed"))
        );
    }

    #[tokio::test]
    async fn skip_qa_runs_without_review_events() {
        let h = Harness::new();
        let config = FsdConfig {
            skip_qa: true,
            ..Default::default()
        };
        let outcomes = vec![
            FakeAgent::success("m1 built", 0.01),
            FakeAgent::success("m2 built", 0.01),
        ];
        let mut orch = h.orchestrator(config, two_step_plan(), outcomes, FakeGuard::new());
        let summary = orch.run("build it", false).await.unwrap();
        assert_eq!(summary.milestones_completed, 2);
        assert!(!h.handler.events().iter().any(|e| e.starts_with("qa_")));
    }

    #[tokio::test]
    async fn resume_continues_from_persisted_checkpoint() {
        let h = Harness::new();
        let paths = RunPaths::new(h.dir.path().to_path_buf()).unwrap();
        paths.ensure_directories().unwrap();

        // Simulate a prior interrupted run: m1 done, plan persisted.
        let plan = two_step_plan();
        std::fs::write(&paths.plan_file, serde_json::to_string(&plan).unwrap()).unwrap();
        let mut prior = FsdState::new();
        prior.completed_milestones.push("m1".to_string());
        prior.record_attempt(0.30);
        StatePersistence::new(paths.state_file.clone())
            .save(&prior, &FsdConfig::default())
            .unwrap();

        // Only m2 should run.
        let outcomes = vec![
            FakeAgent::success("m2 built", 0.05),
            FakeAgent::success(QA_PASS, 0.01),
        ];
        let mut orch = h.orchestrator(FsdConfig::default(), plan, outcomes, FakeGuard::new());
        let summary = orch.run("build it", true).await.unwrap();

        assert_eq!(summary.milestones_completed, 2);
        assert!((summary.total_cost_usd - 0.35).abs() < 1e-9);
        let starts: Vec<String> = h
            .handler
            .events()
            .into_iter()
            .filter(|e| e.starts_with("milestone_start:"))
            .collect();
        assert_eq!(starts, vec!["milestone_start:m2".to_string()]);
        // The planner was never consulted.
        assert!(
            !h.handler
                .events()
                .contains(&"planning_start".to_string())
        );
    }

    #[tokio::test]
    async fn resume_with_mismatched_plan_starts_fresh() {
        let h = Harness::new();
        let paths = RunPaths::new(h.dir.path().to_path_buf()).unwrap();
        paths.ensure_directories().unwrap();

        // Checkpoint references a milestone the current plan does not have.
        let stale_plan = Plan {
            milestones: vec![milestone("old-1", &[])],
            estimated_cost_usd: 0.1,
            estimated_time_minutes: 1,
            risks: vec![],
        };
        std::fs::write(&paths.plan_file, serde_json::to_string(&stale_plan).unwrap()).unwrap();
        let mut prior = FsdState::new();
        prior.completed_milestones.push("ghost".to_string());
        StatePersistence::new(paths.state_file.clone())
            .save(&prior, &FsdConfig::default())
            .unwrap();

        let outcomes = vec![
            FakeAgent::success("m1 built", 0.01),
            FakeAgent::success(QA_PASS, 0.01),
            FakeAgent::success("m2 built", 0.01),
            FakeAgent::success(QA_PASS, 0.01),
        ];
        let mut orch = h.orchestrator(FsdConfig::default(), two_step_plan(), outcomes, FakeGuard::new());
        let summary = orch.run("build it", true).await.unwrap();

        // Fresh run: both milestones executed, ghost state discarded.
        assert_eq!(summary.milestones_completed, 2);
        assert!(h.handler.events().contains(&"planning_start".to_string()));
    }

    #[tokio::test]
    async fn sensitive_approval_declined_stops_the_run() {
        let h = Harness::new();
        let mut handler = RecordingHandler::new();
        handler.confirm_answer = false;
        let handler = Arc::new(handler);

        let paths = RunPaths::new(h.dir.path().to_path_buf()).unwrap();
        paths.ensure_directories().unwrap();
        let agent: Arc<dyn crate::agent::AgentInvoker> = Arc::new(FakeAgent::new(vec![]));
        let config = FsdConfig {
            sensitive_approval: true,
            ..Default::default()
        };
        let mut orch = FsdOrchestrator::new(
            config,
            BillingConfig {
                mode: BillingMode::Byok,
                context: BillingContext::Cli,
            },
            paths.clone(),
            Arc::new(FakePlanner::ok(two_step_plan())),
            MilestoneExecutor::new(agent.clone(), paths.clone(), "goal".to_string()),
            QaReviewer::new(agent, paths.qa_dir.clone(), String::new()),
            Box::new(FakeGuard::new()),
            Arc::clone(&h.pause),
            handler.clone(),
        );
        let err = orch.run("build it", false).await.unwrap_err();
        assert!(err.to_string().contains("approval gate"));
        assert!(handler.events().iter().any(|e| e.starts_with("confirm:")));
    }

    #[tokio::test]
    async fn paused_run_waits_and_resumes_at_the_boundary() {
        let h = Harness::new();
        let outcomes = vec![
            FakeAgent::success("m1 built", 0.01),
            FakeAgent::success(QA_PASS, 0.01),
            FakeAgent::success("m2 built", 0.01),
            FakeAgent::success(QA_PASS, 0.01),
        ];
        let mut orch = h.orchestrator(
            FsdConfig::default(),
            two_step_plan(),
            outcomes,
            FakeGuard::new(),
        );

        h.pause.pause();
        let pause = Arc::clone(&h.pause);
        let task = tokio::spawn(async move { orch.run("build it", false).await });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!task.is_finished());

        pause.resume();
        let summary = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("run should finish after resume")
            .unwrap()
            .unwrap();
        assert_eq!(summary.milestones_completed, 2);
    }

    #[test]
    fn exhaustion_policy_skips_leaves_and_aborts_on_dependents() {
        let plan = two_step_plan();
        assert_eq!(
            exhaustion_policy(&plan, "m1", &[], &[]),
            ExhaustionDecision::Abort
        );
        let completed = vec!["m1".to_string()];
        assert_eq!(
            exhaustion_policy(&plan, "m2", &completed, &[]),
            ExhaustionDecision::Skip
        );
    }

    #[tokio::test]
    async fn checkpoint_interval_batches_saves() {
        let h = Harness::new();
        let config = FsdConfig {
            checkpoint_interval: 2,
            skip_qa: true,
            ..Default::default()
        };
        let plan = Plan {
            milestones: vec![milestone("a", &[]), milestone("b", &[]), milestone("c", &[])],
            estimated_cost_usd: 0.1,
            estimated_time_minutes: 1,
            risks: vec![],
        };
        let outcomes = vec![
            FakeAgent::success("a", 0.01),
            FakeAgent::success("b", 0.01),
            FakeAgent::success("c", 0.01),
        ];
        let mut orch = h.orchestrator(config, plan, outcomes, FakeGuard::new());
        orch.run("build it", false).await.unwrap();
        // Run completed, checkpoint cleared; interval logic exercised above.
        assert!(!h.persistence().exists());
        assert_eq!(orch.state().completed_milestones.len(), 3);
    }
}
