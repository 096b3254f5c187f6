//! Per-item isolated working copies.
//!
//! A workspace is a git worktree under the workspace root, named after the
//! item it belongs to. Creating its directory is the claim: `create_dir`
//! either succeeds for exactly one caller or fails with `AlreadyExists`, so
//! no item can have two live implementation (or review) workspaces.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::board::{Board, ChangeRequest, ItemId, WorkItem};
use crate::errors::WorkspaceError;
use crate::retry::{RetryConfig, retry_transient};
use crate::vcs::{RebaseOutcome, Vcs};

/// An isolated working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: String,
    /// Ref the branch was created from or rebased onto.
    pub base_ref: String,
}

/// Implementation workspace plus the draft change request tracking it.
#[derive(Debug, Clone)]
pub struct ImplementationWorkspace {
    pub workspace: Workspace,
    pub change_request: ChangeRequest,
}

pub struct WorkspaceManager {
    root: PathBuf,
    trunk: String,
    remote: String,
    branch_prefix: String,
    vcs: Arc<dyn Vcs>,
    board: Arc<dyn Board>,
    retry: RetryConfig,
}

impl WorkspaceManager {
    pub fn new(
        root: PathBuf,
        config: &crate::config::WorkspaceSection,
        vcs: Arc<dyn Vcs>,
        board: Arc<dyn Board>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            root,
            trunk: config.trunk.clone(),
            remote: config.remote.clone(),
            branch_prefix: config.branch_prefix.clone(),
            vcs,
            board,
            retry,
        }
    }

    pub fn branch_for(&self, id: ItemId) -> String {
        format!("{}{}", self.branch_prefix, id)
    }

    pub fn implementation_path(&self, id: ItemId) -> PathBuf {
        self.root.join(format!("issue-{}", id))
    }

    pub fn review_path(&self, id: ItemId) -> PathBuf {
        self.root.join(format!("review-{}", id))
    }

    fn review_branch(id: ItemId) -> String {
        format!("review/issue-{}", id)
    }

    fn trunk_ref(&self) -> String {
        format!("{}/{}", self.remote, self.trunk)
    }

    /// Whether an implementation workspace exists for `id`.
    pub fn exists(&self, id: ItemId) -> bool {
        self.implementation_path(id).exists()
    }

    /// Create the workspace for implementing `item`: branch from trunk (or
    /// rebase the existing branch onto it), push, and open a draft change
    /// request if none is open yet.
    pub async fn create_for_implementation(
        &self,
        item: &WorkItem,
    ) -> Result<ImplementationWorkspace, WorkspaceError> {
        let path = self.implementation_path(item.id);
        self.claim(&path)?;

        match self.prepare_implementation(item, &path).await {
            Ok(ws) => {
                tracing::info!(
                    item = item.id,
                    path = %ws.workspace.path.display(),
                    branch = %ws.workspace.branch,
                    change_request = ws.change_request.number,
                    "Implementation workspace ready"
                );
                Ok(ws)
            }
            Err(e) => {
                self.remove(&path).await;
                Err(e)
            }
        }
    }

    async fn prepare_implementation(
        &self,
        item: &WorkItem,
        path: &Path,
    ) -> Result<ImplementationWorkspace, WorkspaceError> {
        let branch = self.branch_for(item.id);
        let base_ref = self.trunk_ref();

        retry_transient("git fetch", &self.retry, || self.vcs.fetch(&self.remote)).await?;
        let remote_exists = self.vcs.remote_branch_exists(&self.remote, &branch).await?;

        if remote_exists {
            let start = format!("{}/{}", self.remote, branch);
            self.vcs.add_worktree(path, &branch, &start).await?;
            match self.vcs.rebase(path, &base_ref).await? {
                RebaseOutcome::Clean => {
                    retry_transient("git push", &self.retry, || {
                        self.vcs.push(path, &self.remote, &branch, true)
                    })
                    .await?;
                }
                RebaseOutcome::Conflict => {
                    tracing::warn!(
                        item = item.id,
                        branch = %branch,
                        onto = %base_ref,
                        "Existing branch conflicts with trunk, continuing on the unrebased branch"
                    );
                }
            }
        } else {
            self.vcs.add_worktree(path, &branch, &base_ref).await?;
            self.vcs
                .commit_marker(path, &format!("chore: start work on #{}", item.id))
                .await?;
            retry_transient("git push", &self.retry, || {
                self.vcs.push(path, &self.remote, &branch, false)
            })
            .await?;
        }

        let existing = retry_transient("change request lookup", &self.retry, || {
            self.board.change_request_for_branch(&branch)
        })
        .await?;
        let change_request = match existing {
            Some(cr) => cr,
            None => {
                let title = format!("Fix #{}: {}", item.id, item.title);
                let body = format!("Closes #{}", item.id);
                self.board
                    .create_draft_change_request(&branch, &self.trunk, &title, &body)
                    .await?
            }
        };

        Ok(ImplementationWorkspace {
            workspace: Workspace {
                path: path.to_path_buf(),
                branch,
                base_ref,
            },
            change_request,
        })
    }

    /// Fresh review workspace: `branch` rebased onto current trunk on a
    /// throwaway local branch. A conflict releases the workspace and fails.
    pub async fn create_for_review(&self, id: ItemId, branch: &str) -> Result<Workspace, WorkspaceError> {
        let path = self.review_path(id);
        self.claim(&path)?;

        match self.prepare_review(id, branch, &path).await {
            Ok(ws) => Ok(ws),
            Err(e) => {
                self.remove(&path).await;
                self.delete_review_branch(id).await;
                Err(e)
            }
        }
    }

    async fn prepare_review(&self, id: ItemId, branch: &str, path: &Path) -> Result<Workspace, WorkspaceError> {
        let base_ref = self.trunk_ref();
        let local = Self::review_branch(id);
        retry_transient("git fetch", &self.retry, || self.vcs.fetch(&self.remote)).await?;

        let start = format!("{}/{}", self.remote, branch);
        self.vcs.add_worktree(path, &local, &start).await?;
        match self.vcs.rebase(path, &base_ref).await? {
            RebaseOutcome::Clean => Ok(Workspace {
                path: path.to_path_buf(),
                branch: local,
                base_ref,
            }),
            RebaseOutcome::Conflict => Err(WorkspaceError::RebaseConflict {
                branch: branch.to_string(),
                onto: base_ref,
            }),
        }
    }

    /// Best-effort teardown of a workspace. Failures are logged.
    pub async fn remove(&self, path: &Path) {
        if let Err(e) = self.vcs.remove_worktree(path).await {
            tracing::debug!(path = %path.display(), error = %e, "git worktree remove failed");
        }
        if path.exists()
            && let Err(e) = tokio::fs::remove_dir_all(path).await
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove workspace directory");
        }
    }

    /// Remove the implementation workspace of `id`.
    pub async fn remove_implementation(&self, id: ItemId) {
        self.remove(&self.implementation_path(id)).await;
    }

    /// Remove the review workspace of `id` and its throwaway branch.
    pub async fn remove_review(&self, id: ItemId) {
        self.remove(&self.review_path(id)).await;
        self.delete_review_branch(id).await;
    }

    /// Remove both workspaces of `id`.
    pub async fn cleanup_item(&self, id: ItemId) {
        self.remove_implementation(id).await;
        self.remove_review(id).await;
    }

    async fn delete_review_branch(&self, id: ItemId) {
        let branch = Self::review_branch(id);
        if let Err(e) = self.vcs.delete_local_branch(&branch).await {
            tracing::debug!(branch = %branch, error = %e, "Review branch not deleted");
        }
    }

    fn claim(&self, path: &Path) -> Result<(), WorkspaceError> {
        std::fs::create_dir_all(&self.root).map_err(|e| WorkspaceError::Io {
            path: self.root.clone(),
            source: e,
        })?;
        match std::fs::create_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(WorkspaceError::AlreadyExists {
                path: path.to_path_buf(),
            }),
            Err(e) => Err(WorkspaceError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}
