//! Version-control operations needed by the workspace manager.
//!
//! Mutating commands go through the `git` CLI (worktrees, rebase, push);
//! read-only ref lookups use `git2` directly.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::WorkspaceError;

/// Result of rebasing a branch onto another ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseOutcome {
    Clean,
    /// The rebase conflicted and was aborted; the branch is unchanged.
    Conflict,
}

/// Version-control surface used by `WorkspaceManager`.
/// Real implementation: `GitCli`. Test double: `testing::MockVcs`.
#[async_trait]
pub trait Vcs: Send + Sync {
    async fn fetch(&self, remote: &str) -> Result<(), WorkspaceError>;

    async fn remote_branch_exists(&self, remote: &str, branch: &str) -> Result<bool, WorkspaceError>;

    /// Check out `branch` at `start` into a new worktree at `path`, resetting
    /// the local branch if it already exists.
    async fn add_worktree(&self, path: &Path, branch: &str, start: &str) -> Result<(), WorkspaceError>;

    async fn rebase(&self, workdir: &Path, onto: &str) -> Result<RebaseOutcome, WorkspaceError>;

    /// Empty commit so a fresh branch differs from trunk and can carry a change request.
    async fn commit_marker(&self, workdir: &Path, message: &str) -> Result<(), WorkspaceError>;

    async fn push(&self, workdir: &Path, remote: &str, branch: &str, force: bool) -> Result<(), WorkspaceError>;

    async fn remove_worktree(&self, path: &Path) -> Result<(), WorkspaceError>;

    async fn delete_local_branch(&self, branch: &str) -> Result<(), WorkspaceError>;
}

/// `Vcs` backed by the git CLI, rooted at the main checkout.
pub struct GitCli {
    repo_dir: PathBuf,
}

impl GitCli {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
        let command = args.join(" ");
        tracing::debug!(dir = %dir.display(), command = %command, "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| WorkspaceError::Io {
                path: dir.to_path_buf(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorkspaceError::Git {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn path_arg(path: &Path) -> Result<&str, WorkspaceError> {
    path.to_str().ok_or_else(|| WorkspaceError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path is not valid UTF-8"),
    })
}

#[async_trait]
impl Vcs for GitCli {
    async fn fetch(&self, remote: &str) -> Result<(), WorkspaceError> {
        self.git(&self.repo_dir, &["fetch", "--prune", remote]).await?;
        Ok(())
    }

    async fn remote_branch_exists(&self, remote: &str, branch: &str) -> Result<bool, WorkspaceError> {
        let repo_dir = self.repo_dir.clone();
        let refname = format!("refs/remotes/{}/{}", remote, branch);
        tokio::task::spawn_blocking(move || {
            let repo = git2::Repository::open(&repo_dir).map_err(|e| WorkspaceError::Git {
                command: "open repository".to_string(),
                stderr: e.message().to_string(),
            })?;
            match repo.find_reference(&refname) {
                Ok(_) => Ok(true),
                Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(false),
                Err(e) => Err(WorkspaceError::Git {
                    command: format!("find-reference {}", refname),
                    stderr: e.message().to_string(),
                }),
            }
        })
        .await
        .map_err(|e| WorkspaceError::Git {
            command: "remote branch lookup".to_string(),
            stderr: e.to_string(),
        })?
    }

    async fn add_worktree(&self, path: &Path, branch: &str, start: &str) -> Result<(), WorkspaceError> {
        let path = path_arg(path)?;
        self.git(&self.repo_dir, &["worktree", "add", "-B", branch, path, start])
            .await?;
        Ok(())
    }

    async fn rebase(&self, workdir: &Path, onto: &str) -> Result<RebaseOutcome, WorkspaceError> {
        match self.git(workdir, &["rebase", onto]).await {
            Ok(_) => Ok(RebaseOutcome::Clean),
            Err(WorkspaceError::Git { stderr, .. }) => {
                tracing::warn!(workdir = %workdir.display(), onto, stderr = %stderr, "Rebase conflicted, aborting");
                if let Err(e) = self.git(workdir, &["rebase", "--abort"]).await {
                    tracing::warn!(error = %e, "git rebase --abort failed");
                }
                Ok(RebaseOutcome::Conflict)
            }
            Err(e) => Err(e),
        }
    }

    async fn commit_marker(&self, workdir: &Path, message: &str) -> Result<(), WorkspaceError> {
        self.git(workdir, &["commit", "--allow-empty", "-m", message]).await?;
        Ok(())
    }

    async fn push(&self, workdir: &Path, remote: &str, branch: &str, force: bool) -> Result<(), WorkspaceError> {
        let mut args = vec!["push", "-u", remote, branch];
        if force {
            args.push("--force-with-lease");
        }
        self.git(workdir, &args).await?;
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path) -> Result<(), WorkspaceError> {
        let path = path_arg(path)?;
        self.git(&self.repo_dir, &["worktree", "remove", "--force", path]).await?;
        Ok(())
    }

    async fn delete_local_branch(&self, branch: &str) -> Result<(), WorkspaceError> {
        self.git(&self.repo_dir, &["branch", "-D", branch]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{Repository, Signature};
    use tempfile::tempdir;

    fn init_repo_with_commit(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        {
            let sig = Signature::now("test", "test@test.com").unwrap();
            let tree_id = repo.index().unwrap().write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[]).unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn remote_branch_lookup_reads_remote_refs() {
        let dir = tempdir().unwrap();
        let repo = init_repo_with_commit(dir.path());
        let head = repo.head().unwrap().peel_to_commit().unwrap().id();
        repo.reference("refs/remotes/origin/fix/issue-42", head, false, "test")
            .unwrap();

        let vcs = GitCli::new(dir.path());
        assert!(vcs.remote_branch_exists("origin", "fix/issue-42").await.unwrap());
        assert!(!vcs.remote_branch_exists("origin", "fix/issue-43").await.unwrap());
    }

    #[tokio::test]
    async fn remote_branch_lookup_outside_a_repo_is_a_git_error() {
        let dir = tempdir().unwrap();
        let vcs = GitCli::new(dir.path().join("missing"));
        let err = vcs.remote_branch_exists("origin", "main").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::Git { .. }));
    }
}
