//! The single write path for item status.

use std::sync::Arc;

use super::transitions::is_valid;
use super::{Board, Status, WorkItem};
use crate::cache::StatusCache;
use crate::errors::BoardError;
use crate::retry::{RetryConfig, retry_transient};

/// Validates, retries, writes, and patches the cache so the item leaves its
/// source loop's input set immediately.
pub struct StatusWriter {
    board: Arc<dyn Board>,
    cache: Arc<StatusCache>,
    retry: RetryConfig,
}

impl StatusWriter {
    pub fn new(board: Arc<dyn Board>, cache: Arc<StatusCache>, retry: RetryConfig) -> Self {
        Self { board, cache, retry }
    }

    pub fn board(&self) -> &Arc<dyn Board> {
        &self.board
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Move `item` to `to`. Moving to the current status is a no-op.
    pub async fn transition(&self, item: &WorkItem, to: Status) -> Result<(), BoardError> {
        let from = item.status;
        if from == to {
            tracing::debug!(item = item.id, status = %to, "Status unchanged");
            return Ok(());
        }
        if !is_valid(from, to) {
            return Err(BoardError::InvalidTransition { id: item.id, from, to });
        }

        retry_transient("set status", &self.retry, || self.board.set_status(item, to)).await?;
        self.cache.note_status(item.id, to).await;
        tracing::info!(item = item.id, from = %from, to = %to, "Status changed");
        Ok(())
    }
}
