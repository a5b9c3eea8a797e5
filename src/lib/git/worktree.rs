use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{bail, Context, Result};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use super::{Repo, RepoActions, RepoPath};

/// An exclusive checkout of one `(repo, branch)` pair. Holding the guard
/// holds the per-key mutation lock; the directory is removed on release.
pub struct WorktreeGuard {
    pub path: PathBuf,
    bare_dir: PathBuf,
    _lock: OwnedMutexGuard<()>,
}

#[derive(Default)]
pub struct WorktreeEngine {
    locks: Mutex<HashMap<String, std::sync::Arc<AsyncMutex<()>>>>,
}

impl WorktreeEngine {
    /// Check out `branch` into the repository's worktrees directory,
    /// creating the branch (or the whole initial history) when needed.
    /// At most one guard exists per `(repo, branch)` at a time; concurrent
    /// callers queue on the per-key lock.
    pub async fn acquire(&self, repo_path: &RepoPath, branch: &str) -> Result<WorktreeGuard> {
        validate_branch_name(branch)?;
        let target = repo_path.worktree_dir(branch)?;

        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(format!("{}|{branch}", repo_path.bare_dir.display()))
                .or_insert_with(|| std::sync::Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;

        tokio::fs::create_dir_all(&repo_path.worktrees_dir)
            .await
            .context("failed to create worktrees directory")?;

        self.remove_stale_worktree(repo_path, branch, &target).await?;

        if target.is_dir() && sanity_check(&target).await {
            return Ok(WorktreeGuard {
                path: target,
                bare_dir: repo_path.bare_dir.clone(),
                _lock: guard,
            });
        }

        let repo = Repo::open(repo_path)?;
        if !repo.has_branches()? {
            // First branch of an empty repository: orphan checkout, then
            // point the bare HEAD at it so later clones see it.
            git_ok(
                &repo_path.bare_dir,
                &[
                    "worktree",
                    "add",
                    "--orphan",
                    branch,
                    target.to_str().context("worktree path is not utf-8")?,
                ],
            )
            .await
            .context("failed to create orphan worktree")?;
            git_ok(
                &repo_path.bare_dir,
                &["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")],
            )
            .await
            .context("failed to update bare HEAD")?;
        } else {
            if !repo.local_branch_names()?.contains(&branch.to_string()) {
                let source = branch_source(&repo)?;
                git_ok(&repo_path.bare_dir, &["branch", branch, &source])
                    .await
                    .context(format!("failed to create branch {branch} from {source}"))?;
            }
            git_ok(
                &repo_path.bare_dir,
                &[
                    "worktree",
                    "add",
                    target.to_str().context("worktree path is not utf-8")?,
                    branch,
                ],
            )
            .await
            .context("failed to add worktree")?;
        }

        Ok(WorktreeGuard {
            path: target,
            bare_dir: repo_path.bare_dir.clone(),
            _lock: guard,
        })
    }

    /// Remove the checkout. Escalates from a clean `worktree remove` to a
    /// forced one to recursive directory removal, and releases the per-key
    /// lock by dropping the guard.
    pub async fn release(&self, guard: WorktreeGuard) -> Result<()> {
        let WorktreeGuard {
            path,
            bare_dir,
            _lock,
        } = guard;
        let path_str = path.to_str().context("worktree path is not utf-8")?;
        if git_ok(&bare_dir, &["worktree", "remove", path_str])
            .await
            .is_err()
            && git_ok(&bare_dir, &["worktree", "remove", "--force", path_str])
                .await
                .is_err()
            && path.is_dir()
        {
            tokio::fs::remove_dir_all(&path)
                .await
                .context("failed to remove worktree directory")?;
            let _ = git_ok(&bare_dir, &["worktree", "prune"]).await;
        }
        Ok(())
    }

    /// A worktree registered for this branch at a different absolute path
    /// is unusable and must go before the target path is (re)created.
    async fn remove_stale_worktree(
        &self,
        repo_path: &RepoPath,
        branch: &str,
        target: &Path,
    ) -> Result<()> {
        let Ok(listing) = git_output(&repo_path.bare_dir, &["worktree", "list", "--porcelain"]).await
        else {
            return Ok(());
        };
        for entry in parse_worktree_list(&listing) {
            if entry.branch.as_deref() == Some(branch) && entry.path != *target {
                debug!(stale = %entry.path.display(), "removing stale worktree");
                let stale = entry.path.to_string_lossy().to_string();
                if git_ok(&repo_path.bare_dir, &["worktree", "remove", "--force", &stale])
                    .await
                    .is_err()
                    && entry.path.is_dir()
                {
                    let _ = tokio::fs::remove_dir_all(&entry.path).await;
                    let _ = git_ok(&repo_path.bare_dir, &["worktree", "prune"]).await;
                }
            }
        }
        Ok(())
    }
}

/// Where a new branch starts from: HEAD's branch if resolvable, then main,
/// then master, then the first branch there is.
fn branch_source(repo: &Repo) -> Result<String> {
    if let Ok(branch) = repo.default_branch() {
        return Ok(branch);
    }
    let branches = repo.local_branch_names()?;
    for candidate in ["main", "master"] {
        if branches.contains(&candidate.to_string()) {
            return Ok(candidate.to_string());
        }
    }
    branches
        .first()
        .cloned()
        .context("repository has no branch to start from")
}

async fn sanity_check(worktree: &Path) -> bool {
    git_ok(worktree, &["status", "--porcelain"]).await.is_ok()
}

pub fn validate_branch_name(branch: &str) -> Result<()> {
    if branch.is_empty() || branch.len() > 255 {
        bail!("branch name must be 1-255 characters");
    }
    if branch.contains("..") || branch.contains("@{") {
        bail!("branch name must not contain '..' or '@{{'");
    }
    if branch.starts_with("refs/") {
        bail!("branch name must not carry a ref prefix");
    }
    if branch.starts_with('-') || branch.starts_with('/') || branch.ends_with('/') {
        bail!("branch name must not start with '-' or begin or end with '/'");
    }
    if branch.ends_with(".lock") {
        bail!("branch name must not end with '.lock'");
    }
    if branch
        .chars()
        .any(|c| c.is_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        bail!("branch name contains forbidden characters");
    }
    Ok(())
}

struct WorktreeEntry {
    path: PathBuf,
    branch: Option<String>,
}

fn parse_worktree_list(listing: &str) -> Vec<WorktreeEntry> {
    let mut entries = vec![];
    let mut current: Option<WorktreeEntry> = None;
    for line in listing.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
            });
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            if let Some(entry) = current.as_mut() {
                entry.branch = Some(branch.to_string());
            }
        }
    }
    if let Some(entry) = current.take() {
        entries.push(entry);
    }
    entries
}

async fn git_output(dir: &Path, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .context("failed to spawn git")?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

async fn git_ok(dir: &Path, args: &[&str]) -> Result<()> {
    git_output(dir, args).await.map(|_| ())
}
