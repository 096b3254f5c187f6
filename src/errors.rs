//! Typed error hierarchy for the devloop orchestrator.
//!
//! One enum per external collaborator:
//! - `BoardError`: tracking-board reads and writes (via `gh`)
//! - `WorkspaceError`: working-copy creation and teardown (via `git`)
//! - `DispatchError`: agent pool admission and agent process failures
//! - `ConfigError`: invalid `devloop.toml` values
//!
//! Every variant knows whether it is transient. Transient failures are
//! retried with backoff (see `retry`) and otherwise swallowed until the next
//! cycle; permanent failures skip only the operation that produced them.

use std::path::PathBuf;

use thiserror::Error;

use crate::board::{ItemId, Status};
use crate::retry::Transient;

/// Errors from the tracking board.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Board command failed ({code:?}): {command}\n{stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Board command timed out after {secs}s: {command}")]
    Timeout { command: String, secs: u64 },

    #[error("Failed to spawn board command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Invalid JSON from board command {command}: {message}")]
    InvalidJson { command: String, message: String },

    #[error("Item #{id} not found on the board")]
    UnknownItem { id: ItemId },

    #[error("Invalid transition for #{id}: {from} → {to}")]
    InvalidTransition { id: ItemId, from: Status, to: Status },

    #[error("No option id configured for status {0}")]
    MissingOption(Status),
}

impl Transient for BoardError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            BoardError::CommandFailed { .. } | BoardError::Timeout { .. } | BoardError::InvalidJson { .. }
        )
    }
}

/// Errors from the workspace manager.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Workspace already exists at {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("Rebase of {branch} onto {onto} conflicted")]
    RebaseConflict { branch: String, onto: String },

    #[error("Workspace I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open change request: {0}")]
    ChangeRequest(#[from] BoardError),
}

impl Transient for WorkspaceError {
    fn is_transient(&self) -> bool {
        match self {
            WorkspaceError::Git { .. } => true,
            WorkspaceError::ChangeRequest(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Errors from an agent pool.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{phase} pool is full ({capacity} active)")]
    PoolFull { phase: String, capacity: usize },

    #[error("#{item} already has a live {phase} invocation")]
    AlreadyActive { phase: String, item: ItemId },

    #[error("Failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to write agent log at {}: {source}", path.display())]
    LogWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl Transient for DispatchError {
    fn is_transient(&self) -> bool {
        false
    }
}

/// Errors from configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Pool capacity for {phase} must be at least 1")]
    ZeroCapacity { phase: String },

    #[error("Interval '{name}' must be greater than zero")]
    ZeroInterval { name: String },

    #[error("max_bounces must be at least 1")]
    ZeroMaxBounces,

    #[error("board.repo must be set (owner/name)")]
    MissingRepo,
}
