//! Reporting surface for the run.
//!
//! The orchestrator only ever talks to the [`OutputHandler`] trait. Two
//! conforming implementations exist: [`ConsoleReporter`] prints plain
//! lines, [`InteractiveReporter`] renders `indicatif` progress bars. Which
//! one is active is decided at startup (`--no-ink` forces the console
//! variant).

use crate::plan::{Milestone, Plan};
use crate::qa::QaIssue;
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Final run totals reported on completion.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub milestones_completed: usize,
    pub milestones_skipped: usize,
    pub total_cost_usd: f64,
    pub total_prompts: u32,
    pub elapsed_minutes: i64,
    pub failed_attempts: u32,
}

/// Everything the core reports to the outside world.
pub trait OutputHandler: Send + Sync {
    fn start(&self, goal: &str);
    fn complete(&self, summary: &RunSummary);
    fn error(&self, message: &str);

    fn planning_start(&self);
    fn planning_complete(&self, plan: &Plan);
    fn show_plan(&self, plan: &Plan);

    fn milestone_start(&self, milestone: &Milestone, index: usize, total: usize);
    fn milestone_complete(&self, milestone: &Milestone);
    fn milestone_failed(&self, milestone: &Milestone, message: &str);
    fn milestone_skipped(&self, milestone: &Milestone);

    fn qa_start(&self, milestone: &Milestone);
    fn qa_complete(&self, milestone: &Milestone, passed: bool);
    fn qa_issue(&self, issue: &QaIssue);

    /// Streaming agent text.
    fn output(&self, text: &str);
    /// Short live status line (tool use, step progress).
    fn progress(&self, message: &str);

    /// Blocking yes/no question. Implementations honoring `--yes` return
    /// true without prompting.
    fn confirm(&self, question: &str) -> bool;

    fn security_status(&self, message: &str);
    fn git_branch(&self, branch: &str);
    fn git_complete(&self, branch: &str);

    fn show_blockers(&self, blockers: &[String]);
}

fn plan_lines(plan: &Plan) -> Vec<String> {
    let mut lines = Vec::new();
    for m in &plan.milestones {
        let deps = if m.depends_on.is_empty() {
            String::new()
        } else {
            format!(" (after {})", m.depends_on.join(", "))
        };
        lines.push(format!("  {} {}{}", style(&m.id).cyan(), m.title, deps));
    }
    lines.push(format!(
        "  est. ${:.2}, ~{} min",
        plan.estimated_cost_usd, plan.estimated_time_minutes
    ));
    for risk in &plan.risks {
        lines.push(format!("  {} {}", style("risk:").yellow(), risk));
    }
    lines
}

/// One-line completion totals, identical across reporters.
fn summary_line(summary: &RunSummary) -> String {
    format!(
        "{} milestones done, {} skipped, ${:.2} across {} prompts in {} min ({} failed attempts)",
        summary.milestones_completed,
        summary.milestones_skipped,
        summary.total_cost_usd,
        summary.total_prompts,
        summary.elapsed_minutes,
        summary.failed_attempts,
    )
}

/// Plain-console reporter, used with `--no-ink` and in non-tty contexts.
pub struct ConsoleReporter {
    verbose: bool,
    assume_yes: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool, assume_yes: bool) -> Self {
        Self {
            verbose,
            assume_yes,
        }
    }
}

impl OutputHandler for ConsoleReporter {
    fn start(&self, goal: &str) {
        println!("{} {}", style("fsd:").bold(), goal);
    }

    fn complete(&self, summary: &RunSummary) {
        println!("{} {}", style("✓").green().bold(), summary_line(summary));
    }

    fn error(&self, message: &str) {
        eprintln!("{} {}", style("error:").red().bold(), message);
    }

    fn planning_start(&self) {
        println!("{}", style("Planning milestones...").dim());
    }

    fn planning_complete(&self, plan: &Plan) {
        println!(
            "{} {} milestones planned",
            style("✓").green(),
            plan.milestones.len()
        );
    }

    fn show_plan(&self, plan: &Plan) {
        for line in plan_lines(plan) {
            println!("{line}");
        }
    }

    fn milestone_start(&self, milestone: &Milestone, index: usize, total: usize) {
        println!(
            "{} [{}/{}] {}: {}",
            style("▶").cyan(),
            index,
            total,
            style(&milestone.id).yellow(),
            milestone.title
        );
    }

    fn milestone_complete(&self, milestone: &Milestone) {
        println!("{} {} complete", style("✓").green(), milestone.id);
    }

    fn milestone_failed(&self, milestone: &Milestone, message: &str) {
        println!(
            "{} {} failed: {}",
            style("✗").red(),
            milestone.id,
            message
        );
    }

    fn milestone_skipped(&self, milestone: &Milestone) {
        println!("{} {} skipped", style("↷").yellow(), milestone.id);
    }

    fn qa_start(&self, milestone: &Milestone) {
        println!("{} reviewing {}", style("QA").magenta(), milestone.id);
    }

    fn qa_complete(&self, milestone: &Milestone, passed: bool) {
        if passed {
            println!("{} QA passed for {}", style("✓").green(), milestone.id);
        } else {
            println!("{} QA failed for {}", style("✗").red(), milestone.id);
        }
    }

    fn qa_issue(&self, issue: &QaIssue) {
        println!(
            "  {} [{}] {}",
            style("•").dim(),
            issue.severity,
            issue.description
        );
    }

    fn output(&self, text: &str) {
        if self.verbose {
            println!("{}", style(text).dim());
        }
    }

    fn progress(&self, message: &str) {
        println!("  {} {}", style("→").dim(), style(message).dim());
    }

    fn confirm(&self, question: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(question)
            .default(false)
            .interact()
            .unwrap_or(false)
    }

    fn security_status(&self, message: &str) {
        println!("{} {}", style("shield:").blue(), message);
    }

    fn git_branch(&self, branch: &str) {
        println!(
            "{} working on isolated branch {}",
            style("git:").blue(),
            style(branch).bold()
        );
    }

    fn git_complete(&self, branch: &str) {
        println!(
            "{} session recorded on {} — review and push manually",
            style("git:").blue(),
            style(branch).bold()
        );
    }

    fn show_blockers(&self, blockers: &[String]) {
        for blocker in blockers {
            println!("{} {}", style("blocked:").red().bold(), blocker);
        }
    }
}

/// Rich interactive reporter built on `indicatif`.
///
/// Two stacked bars: a milestone bar tracking completions and a spinner for
/// the live status line.
pub struct InteractiveReporter {
    multi: MultiProgress,
    milestone_bar: ProgressBar,
    status_bar: ProgressBar,
    verbose: bool,
    assume_yes: bool,
    ticking: AtomicBool,
}

impl InteractiveReporter {
    pub fn new(verbose: bool, assume_yes: bool) -> Self {
        let multi = MultiProgress::new();

        let milestone_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let milestone_bar = multi.add(ProgressBar::new(0));
        milestone_bar.set_style(milestone_style);
        milestone_bar.set_prefix("Milestones");

        let status_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let status_bar = multi.add(ProgressBar::new_spinner());
        status_bar.set_style(status_style);
        status_bar.set_prefix("    Status");

        Self {
            multi,
            milestone_bar,
            status_bar,
            verbose,
            assume_yes,
            ticking: AtomicBool::new(false),
        }
    }

    /// Print above the bars, falling back to stderr if the renderer fails.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    fn tick(&self) {
        if !self.ticking.swap(true, Ordering::SeqCst) {
            self.status_bar.enable_steady_tick(Duration::from_millis(100));
        }
    }
}

impl OutputHandler for InteractiveReporter {
    fn start(&self, goal: &str) {
        self.print_line(format!("{} {}", style("fsd:").bold(), goal));
    }

    fn complete(&self, summary: &RunSummary) {
        self.status_bar.finish_and_clear();
        self.milestone_bar.finish_and_clear();
        self.print_line(format!(
            "{} {}",
            style("✓").green().bold(),
            summary_line(summary)
        ));
    }

    fn error(&self, message: &str) {
        self.status_bar.finish_and_clear();
        self.print_line(format!("{} {}", style("error:").red().bold(), message));
    }

    fn planning_start(&self) {
        self.tick();
        self.status_bar.set_message("planning milestones...");
    }

    fn planning_complete(&self, plan: &Plan) {
        self.milestone_bar.set_length(plan.milestones.len() as u64);
        self.status_bar
            .set_message(format!("{} milestones planned", plan.milestones.len()));
    }

    fn show_plan(&self, plan: &Plan) {
        for line in plan_lines(plan) {
            self.print_line(line);
        }
    }

    fn milestone_start(&self, milestone: &Milestone, _index: usize, _total: usize) {
        self.tick();
        self.milestone_bar.set_message(format!(
            "{}: {}",
            style(&milestone.id).yellow(),
            milestone.title
        ));
        self.status_bar.set_message("starting...");
    }

    fn milestone_complete(&self, milestone: &Milestone) {
        self.milestone_bar.inc(1);
        self.print_line(format!(
            "{} {} complete",
            style("✓").green(),
            milestone.id
        ));
    }

    fn milestone_failed(&self, milestone: &Milestone, message: &str) {
        self.print_line(format!(
            "{} {} failed: {}",
            style("✗").red(),
            milestone.id,
            message
        ));
    }

    fn milestone_skipped(&self, milestone: &Milestone) {
        self.milestone_bar.inc(1);
        self.print_line(format!(
            "{} {} skipped",
            style("↷").yellow(),
            milestone.id
        ));
    }

    fn qa_start(&self, milestone: &Milestone) {
        self.status_bar
            .set_message(format!("QA review of {}", milestone.id));
    }

    fn qa_complete(&self, milestone: &Milestone, passed: bool) {
        let mark = if passed {
            style("✓").green()
        } else {
            style("✗").red()
        };
        self.print_line(format!("{mark} QA {} for {}", if passed { "passed" } else { "failed" }, milestone.id));
    }

    fn qa_issue(&self, issue: &QaIssue) {
        self.print_line(format!(
            "  {} [{}] {}",
            style("•").dim(),
            issue.severity,
            issue.description
        ));
    }

    fn output(&self, text: &str) {
        if self.verbose {
            self.print_line(style(text).dim().to_string());
        }
    }

    fn progress(&self, message: &str) {
        self.status_bar.set_message(message.to_string());
    }

    fn confirm(&self, question: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        self.status_bar.disable_steady_tick();
        self.ticking.store(false, Ordering::SeqCst);
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(question)
            .default(false)
            .interact()
            .unwrap_or(false)
    }

    fn security_status(&self, message: &str) {
        self.print_line(format!("{} {}", style("shield:").blue(), message));
    }

    fn git_branch(&self, branch: &str) {
        self.print_line(format!(
            "{} working on isolated branch {}",
            style("git:").blue(),
            style(branch).bold()
        ));
    }

    fn git_complete(&self, branch: &str) {
        self.print_line(format!(
            "{} session recorded on {} — review and push manually",
            style("git:").blue(),
            style(branch).bold()
        ));
    }

    fn show_blockers(&self, blockers: &[String]) {
        for blocker in blockers {
            self.print_line(format!("{} {}", style("blocked:").red().bold(), blocker));
        }
    }
}
