//! Git protection for the session.
//!
//! Before the first milestone the guard moves work onto an isolated
//! `fsd/<timestamp>` branch and installs a pre-push hook that refuses
//! pushes until the session ends. Pushing is a manual, post-review step.
//! On completion it writes a human-readable session summary and lifts the
//! push block. Failure to establish the branch is fatal and aborts the run
//! before any milestone executes.

use crate::output::RunSummary;
use anyhow::{Context, Result};
use chrono::Utc;
use git2::Repository;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

const PUSH_BLOCK_HOOK: &str = "#!/bin/sh
echo 'fsd: pushes are blocked while a self-driving session is active.' >&2
echo 'fsd: review the session branch and push manually after it completes.' >&2
exit 1
";

pub trait GitProtection: Send {
    /// Create and check out the isolated branch, install the push block,
    /// and return the branch name.
    fn protect(&mut self) -> Result<String>;

    fn branch_name(&self) -> Option<&str>;

    /// Record the session summary and lift the push block.
    fn finalize(&mut self, summary: &RunSummary, completed: &[String]) -> Result<()>;
}

/// Real implementation over libgit2.
pub struct GitProtectionGuard {
    project_dir: PathBuf,
    summary_file: PathBuf,
    branch: Option<String>,
}

impl GitProtectionGuard {
    pub fn new(project_dir: PathBuf, summary_file: PathBuf) -> Self {
        Self {
            project_dir,
            summary_file,
            branch: None,
        }
    }

    fn hook_path(repo: &Repository) -> PathBuf {
        repo.path().join("hooks").join("pre-push")
    }

    fn saved_hook_path(repo: &Repository) -> PathBuf {
        repo.path().join("hooks").join("pre-push.fsd-saved")
    }

    /// HEAD commit, creating an initial snapshot commit for unborn repos.
    fn head_commit<'r>(&self, repo: &'r Repository) -> Result<git2::Commit<'r>> {
        if let Ok(head) = repo.head() {
            if let Ok(commit) = head.peel_to_commit() {
                return Ok(commit);
            }
        }
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = git2::Signature::now("fsd", "fsd@localhost")?;
        let oid = repo.commit(Some("HEAD"), &sig, &sig, "[fsd] session start", &tree, &[])?;
        repo.find_commit(oid).context("Failed to find session commit")
    }

    fn install_push_block(&self, repo: &Repository) -> Result<()> {
        let hook = Self::hook_path(repo);
        if let Some(parent) = hook.parent() {
            fs::create_dir_all(parent).context("Failed to create hooks directory")?;
        }
        if hook.exists() {
            fs::rename(&hook, Self::saved_hook_path(repo))
                .context("Failed to set aside existing pre-push hook")?;
        }
        fs::write(&hook, PUSH_BLOCK_HOOK).context("Failed to write pre-push hook")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&hook, fs::Permissions::from_mode(0o755))
                .context("Failed to mark pre-push hook executable")?;
        }
        Ok(())
    }

    fn remove_push_block(&self, repo: &Repository) -> Result<()> {
        let hook = Self::hook_path(repo);
        if hook.exists() {
            fs::remove_file(&hook).context("Failed to remove pre-push hook")?;
        }
        let saved = Self::saved_hook_path(repo);
        if saved.exists() {
            fs::rename(&saved, &hook).context("Failed to restore pre-push hook")?;
        }
        Ok(())
    }
}

impl GitProtection for GitProtectionGuard {
    fn protect(&mut self) -> Result<String> {
        let repo =
            Repository::open(&self.project_dir).context("Failed to open git repository")?;
        let head = self.head_commit(&repo)?;

        let name = format!("fsd/{}", Utc::now().format("%Y%m%d-%H%M%S"));
        repo.branch(&name, &head, false)
            .with_context(|| format!("Failed to create branch {name}"))?;
        repo.set_head(&format!("refs/heads/{name}"))
            .context("Failed to check out session branch")?;

        self.install_push_block(&repo)?;
        debug!(branch = %name, "git protection established");

        self.branch = Some(name.clone());
        Ok(name)
    }

    fn branch_name(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    fn finalize(&mut self, summary: &RunSummary, completed: &[String]) -> Result<()> {
        let branch = self.branch.as_deref().unwrap_or("(no branch)");
        let mut text = format!(
            "# FSD session summary\n\n\
             - Branch: {branch}\n\
             - Finished: {}\n\
             - Milestones completed: {}\n\
             - Milestones skipped: {}\n\
             - Total cost: ${:.2} across {} prompts\n\
             - Elapsed: {} minutes\n\
             - Failed attempts: {}\n",
            Utc::now().to_rfc3339(),
            summary.milestones_completed,
            summary.milestones_skipped,
            summary.total_cost_usd,
            summary.total_prompts,
            summary.elapsed_minutes,
            summary.failed_attempts,
        );
        if !completed.is_empty() {
            text.push_str("\n## Completed\n");
            for id in completed {
                text.push_str(&format!("- {id}\n"));
            }
        }
        if let Some(parent) = self.summary_file.parent() {
            fs::create_dir_all(parent).context("Failed to create summary directory")?;
        }
        fs::write(&self.summary_file, text).context("Failed to write session summary")?;

        match Repository::open(&self.project_dir) {
            Ok(repo) => self.remove_push_block(&repo)?,
            Err(e) => warn!(error = %e, "could not lift push block"),
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn init_repo(dir: &std::path::Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        std::fs::write(dir.join("README.md"), "# test\n").unwrap();
        {
            let mut index = repo.index().unwrap();
            index
                .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
                .unwrap();
            index.write().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = git2::Signature::now("test", "test@localhost").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
                .unwrap();
        }
        repo
    }

    #[test]
    fn protect_creates_and_checks_out_session_branch() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());

        let mut guard = GitProtectionGuard::new(
            dir.path().to_path_buf(),
            dir.path().join(".fsd/session-summary.md"),
        );
        let branch = guard.protect().unwrap();
        assert!(branch.starts_with("fsd/"));
        assert_eq!(guard.branch_name(), Some(branch.as_str()));

        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap();
        assert_eq!(head.shorthand(), Some(branch.as_str()));
    }

    #[test]
    fn protect_installs_push_blocking_hook() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());

        let mut guard = GitProtectionGuard::new(
            dir.path().to_path_buf(),
            dir.path().join(".fsd/session-summary.md"),
        );
        guard.protect().unwrap();

        let hook = repo.path().join("hooks/pre-push");
        assert!(hook.exists());
        let content = std::fs::read_to_string(&hook).unwrap();
        assert!(content.contains("exit 1"));
    }

    #[test]
    fn protect_preserves_existing_hook_and_finalize_restores_it() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let hooks = repo.path().join("hooks");
        std::fs::create_dir_all(&hooks).unwrap();
        std::fs::write(hooks.join("pre-push"), "#!/bin/sh\nexit 0\n").unwrap();

        let mut guard = GitProtectionGuard::new(
            dir.path().to_path_buf(),
            dir.path().join(".fsd/session-summary.md"),
        );
        guard.protect().unwrap();
        assert!(hooks.join("pre-push.fsd-saved").exists());

        guard
            .finalize(&RunSummary::default(), &["m1".to_string()])
            .unwrap();
        assert!(!hooks.join("pre-push.fsd-saved").exists());
        let restored = std::fs::read_to_string(hooks.join("pre-push")).unwrap();
        assert!(restored.contains("exit 0"));
    }

    #[test]
    fn protect_fails_without_repository() {
        let dir = tempdir().unwrap();
        let mut guard = GitProtectionGuard::new(
            dir.path().to_path_buf(),
            dir.path().join("summary.md"),
        );
        assert!(guard.protect().is_err());
    }

    #[test]
    fn protect_handles_unborn_repository() {
        let dir = tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}\n").unwrap();

        let mut guard = GitProtectionGuard::new(
            dir.path().to_path_buf(),
            dir.path().join(".fsd/session-summary.md"),
        );
        let branch = guard.protect().unwrap();
        assert!(branch.starts_with("fsd/"));
    }

    #[test]
    fn finalize_writes_session_summary() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());

        let summary_file = dir.path().join(".fsd/session-summary.md");
        let mut guard = GitProtectionGuard::new(dir.path().to_path_buf(), summary_file.clone());
        guard.protect().unwrap();

        let summary = RunSummary {
            milestones_completed: 3,
            milestones_skipped: 1,
            total_cost_usd: 1.23,
            total_prompts: 9,
            elapsed_minutes: 14,
            failed_attempts: 2,
        };
        guard
            .finalize(&summary, &["m1".to_string(), "m2".to_string()])
            .unwrap();

        let text = std::fs::read_to_string(summary_file).unwrap();
        assert!(text.contains("$1.23"));
        assert!(text.contains("- m1"));
        assert!(text.contains("Failed attempts: 2"));

        let repo = Repository::open(dir.path()).unwrap();
        assert!(!repo.path().join("hooks/pre-push").exists());
    }
}
