//! Minimal git helpers shared by project-init (ensure a repo exists before
//! the first agent invocation) and the launcher (derive the per-branch port
//! from the checked-out branch name).

use crate::errors::GitError;
use git2::Repository;
use std::path::Path;

/// Opens the repository at `project_dir`, running `git init` first if none
/// exists yet. Mirrors the reference orchestrator's "ensure git repo" step:
/// the agent's phase commits need somewhere to land.
pub fn ensure_repo(project_dir: &Path) -> Result<Repository, GitError> {
    match Repository::open(project_dir) {
        Ok(repo) => Ok(repo),
        Err(_) => Repository::init(project_dir).map_err(GitError::OpenOrInitFailed),
    }
}

/// The shorthand name of the currently checked-out branch (e.g. `main`,
/// `feature/foo`). Falls back to `"main"` for a freshly initialized repo
/// with no commits yet, where `HEAD` is unborn and has no shorthand.
pub fn current_branch(project_dir: &Path) -> Result<String, GitError> {
    let repo = Repository::open(project_dir).map_err(GitError::OpenOrInitFailed)?;
    match repo.head() {
        Ok(head) => Ok(head.shorthand().unwrap_or("main").to_string()),
        Err(_) => Ok("main".to_string()),
    }
}
