//! Read-through status cache over the tracking board.
//!
//! Every loop reads item statuses from here instead of hitting the board.
//! A snapshot is served until it is `ttl` old; the first reader after expiry
//! refreshes it while concurrent readers wait on the same refresh and reuse
//! its result. Results may be up to one TTL stale, so callers must tolerate
//! an item having moved since the snapshot was taken.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::board::{Board, ItemId, Status, WorkItem};
use crate::errors::BoardError;

/// One fetch of the board.
#[derive(Debug, Clone)]
pub struct BoardSnapshot {
    pub items: BTreeMap<ItemId, WorkItem>,
    pub captured_at: Instant,
}

impl BoardSnapshot {
    fn new(items: Vec<WorkItem>) -> Self {
        Self {
            items: items.into_iter().map(|item| (item.id, item)).collect(),
            captured_at: Instant::now(),
        }
    }

    /// Items in `status`, ascending by id.
    pub fn by_status(&self, status: Status) -> Vec<WorkItem> {
        self.items.values().filter(|item| item.status == status).cloned().collect()
    }

    /// Item count per status, in canonical order, zero counts included.
    pub fn counts(&self) -> Vec<(Status, usize)> {
        Status::ALL
            .iter()
            .map(|status| (*status, self.items.values().filter(|i| i.status == *status).count()))
            .collect()
    }
}

pub struct StatusCache {
    board: Arc<dyn Board>,
    ttl: Duration,
    snapshot: RwLock<Option<Arc<BoardSnapshot>>>,
    refresh: Mutex<()>,
    fetches: AtomicU64,
}

impl StatusCache {
    pub fn new(board: Arc<dyn Board>, ttl: Duration) -> Self {
        Self {
            board,
            ttl,
            snapshot: RwLock::new(None),
            refresh: Mutex::new(()),
            fetches: AtomicU64::new(0),
        }
    }

    /// Current snapshot, refreshing it first if expired or invalidated.
    pub async fn snapshot(&self) -> Result<Arc<BoardSnapshot>, BoardError> {
        if let Some(snap) = self.fresh().await {
            return Ok(snap);
        }

        let _guard = self.refresh.lock().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(snap) = self.fresh().await {
            return Ok(snap);
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let items = self.board.list_items().await?;
        let snap = Arc::new(BoardSnapshot::new(items));
        tracing::debug!(items = snap.items.len(), "Status cache refreshed");
        *self.snapshot.write().await = Some(Arc::clone(&snap));
        Ok(snap)
    }

    pub async fn get(&self, id: ItemId) -> Result<Option<WorkItem>, BoardError> {
        Ok(self.snapshot().await?.items.get(&id).cloned())
    }

    pub async fn list_by_status(&self, status: Status) -> Result<Vec<WorkItem>, BoardError> {
        Ok(self.snapshot().await?.by_status(status))
    }

    pub async fn counts(&self) -> Result<Vec<(Status, usize)>, BoardError> {
        Ok(self.snapshot().await?.counts())
    }

    /// Force the next read to refetch.
    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
    }

    /// Record a status this process just wrote, so the next read within the
    /// TTL does not hand the item back to the loop it just left.
    pub async fn note_status(&self, id: ItemId, status: Status) {
        let mut guard = self.snapshot.write().await;
        if let Some(current) = guard.as_ref()
            && current.items.contains_key(&id)
        {
            let mut next = (**current).clone();
            if let Some(item) = next.items.get_mut(&id) {
                item.status = status;
            }
            *guard = Some(Arc::new(next));
        }
    }

    /// Number of board fetches performed so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    async fn fresh(&self) -> Option<Arc<BoardSnapshot>> {
        let guard = self.snapshot.read().await;
        guard
            .as_ref()
            .filter(|snap| snap.captured_at.elapsed() < self.ttl)
            .map(Arc::clone)
    }
}
