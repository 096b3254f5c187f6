//! Shared rate governor for the board's API quota.
//!
//! All loops consult one governor so a single busy phase cannot exhaust the
//! quota for the others. The quota is fetched at most once per snapshot TTL;
//! dispatch is held while `remaining < threshold`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::board::{Board, RateLimit};
use crate::config::RateLimitSection;
use crate::control::StopSignal;
use crate::util::atomic_write_json;

/// Result of waiting for the quota to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Clear,
    /// A global stop arrived while waiting.
    Aborted,
}

/// On-disk form of the last quota reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateRecord {
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Cached {
    quota: RateLimit,
    captured: Instant,
}

pub struct RateGovernor {
    board: Arc<dyn Board>,
    threshold: u64,
    ttl: Duration,
    recheck: Duration,
    state: Mutex<Option<Cached>>,
    record_path: Option<PathBuf>,
}

impl RateGovernor {
    pub fn new(board: Arc<dyn Board>, config: &RateLimitSection) -> Self {
        Self {
            board,
            threshold: config.threshold,
            ttl: Duration::from_secs(config.snapshot_ttl_secs),
            recheck: Duration::from_secs(config.wait_secs),
            state: Mutex::new(None),
            record_path: None,
        }
    }

    /// Persist every reading to `path`, seeding the cache from it if still fresh.
    pub fn with_record(mut self, path: PathBuf) -> Self {
        if let Some(cached) = load_record(&path, self.ttl) {
            tracing::debug!(remaining = cached.quota.remaining, "Seeded rate snapshot from disk");
            self.state = Mutex::new(Some(cached));
        }
        self.record_path = Some(path);
        self
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Current quota, refetched if the cached one is older than the TTL.
    /// A failed fetch falls back to the previous reading, if any.
    pub async fn snapshot(&self) -> Option<RateLimit> {
        let mut state = self.state.lock().await;
        if let Some(cached) = state.as_ref()
            && cached.captured.elapsed() < self.ttl
        {
            return Some(cached.quota);
        }

        match self.board.rate_limit().await {
            Ok(quota) => {
                *state = Some(Cached {
                    quota,
                    captured: Instant::now(),
                });
                self.persist(&quota);
                Some(quota)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch rate limit, reusing last snapshot");
                state.as_ref().map(|cached| cached.quota)
            }
        }
    }

    /// True when the last known quota is below the threshold.
    /// An unknown quota is treated as not limited.
    pub async fn is_limited(&self) -> bool {
        match self.snapshot().await {
            Some(quota) => quota.remaining < self.threshold,
            None => false,
        }
    }

    /// Block until the quota recovers, rechecking every `wait_secs`.
    pub async fn wait_until_clear(&self, loop_name: &str, stop: &StopSignal) -> WaitOutcome {
        loop {
            if stop.is_stopped() {
                return WaitOutcome::Aborted;
            }
            let Some(quota) = self.snapshot().await else {
                return WaitOutcome::Clear;
            };
            if quota.remaining >= self.threshold {
                return WaitOutcome::Clear;
            }

            tracing::info!(
                loop_name,
                remaining = quota.remaining,
                threshold = self.threshold,
                reset_at = ?quota.reset_at,
                "Rate limited, waiting"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.recheck) => {}
                _ = stop.stopped() => return WaitOutcome::Aborted,
            }
        }
    }

    fn persist(&self, quota: &RateLimit) {
        let Some(path) = &self.record_path else {
            return;
        };
        let record = RateRecord {
            remaining: quota.remaining,
            limit: quota.limit,
            reset_at: quota.reset_at,
            captured_at: Utc::now(),
        };
        if let Err(e) = atomic_write_json(path, &record) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist rate snapshot");
        }
    }
}

/// Last persisted quota reading, regardless of age.
pub fn read_record(path: &std::path::Path) -> Option<RateRecord> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn load_record(path: &std::path::Path, ttl: Duration) -> Option<Cached> {
    let record = read_record(path)?;
    let age = (Utc::now() - record.captured_at).to_std().ok()?;
    if age >= ttl {
        return None;
    }
    Some(Cached {
        quota: RateLimit {
            remaining: record.remaining,
            limit: record.limit,
            reset_at: record.reset_at,
        },
        captured: Instant::now().checked_sub(age)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBoard;
    use tempfile::tempdir;

    fn config() -> RateLimitSection {
        RateLimitSection {
            threshold: 1000,
            snapshot_ttl_secs: 30,
            wait_secs: 60,
        }
    }

    #[tokio::test]
    async fn below_threshold_is_limited() {
        let board = Arc::new(MemoryBoard::new());
        board.set_remaining(500);
        let governor = RateGovernor::new(board, &config());
        assert!(governor.is_limited().await);
    }

    #[tokio::test]
    async fn at_threshold_is_clear() {
        let board = Arc::new(MemoryBoard::new());
        board.set_remaining(1000);
        let governor = RateGovernor::new(board, &config());
        assert!(!governor.is_limited().await);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_reused_within_ttl() {
        let board = Arc::new(MemoryBoard::new());
        board.set_remaining(4000);
        let governor = RateGovernor::new(board.clone(), &config());
        governor.snapshot().await;
        governor.snapshot().await;
        assert_eq!(board.rate_limit_calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        governor.snapshot().await;
        assert_eq!(board.rate_limit_calls(), 2);
    }

    #[tokio::test]
    async fn unknown_quota_is_not_limited() {
        let board = Arc::new(MemoryBoard::new());
        board.fail_rate_limit(true);
        let governor = RateGovernor::new(board, &config());
        assert!(!governor.is_limited().await);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_reuses_previous_reading() {
        let board = Arc::new(MemoryBoard::new());
        board.set_remaining(200);
        let governor = RateGovernor::new(board.clone(), &config());
        assert!(governor.is_limited().await);

        board.fail_rate_limit(true);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(governor.is_limited().await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_quota_recovers() {
        let board = Arc::new(MemoryBoard::new());
        board.set_remaining(500);
        let governor = Arc::new(RateGovernor::new(board.clone(), &config()));
        let stop = StopSignal::new();

        let waiter = {
            let governor = Arc::clone(&governor);
            let stop = stop.clone();
            tokio::spawn(async move { governor.wait_until_clear("implement", &stop).await })
        };

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!waiter.is_finished());

        board.set_remaining(1000);
        let outcome = tokio::time::timeout(Duration::from_secs(61), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Clear);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_share_one_reading_per_ttl() {
        let board = Arc::new(MemoryBoard::new());
        board.set_remaining(500);
        let governor = Arc::new(RateGovernor::new(board.clone(), &config()));
        let stop = StopSignal::new();

        let mut waiters = Vec::new();
        for n in 0..8 {
            let governor = Arc::clone(&governor);
            let stop = stop.clone();
            waiters.push(tokio::spawn(async move {
                governor.wait_until_clear(&format!("loop-{}", n), &stop).await
            }));
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        tokio::time::sleep(Duration::from_secs(560)).await;
        stop.trigger();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), WaitOutcome::Aborted);
        }

        // 600s at a 30s TTL allows at most one fetch per window.
        assert!(board.rate_limit_calls() <= 21, "fetched {} times", board.rate_limit_calls());
        assert!(board.rate_limit_calls() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_aborts_on_stop() {
        let board = Arc::new(MemoryBoard::new());
        board.set_remaining(10);
        let governor = Arc::new(RateGovernor::new(board, &config()));
        let stop = StopSignal::new();

        let waiter = {
            let governor = Arc::clone(&governor);
            let stop = stop.clone();
            tokio::spawn(async move { governor.wait_until_clear("review", &stop).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        stop.trigger();
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Aborted);
    }

    #[tokio::test]
    async fn readings_are_persisted_and_reloaded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rate-limit.json");
        let board = Arc::new(MemoryBoard::new());
        board.set_remaining(1234);

        let governor = RateGovernor::new(board.clone(), &config()).with_record(path.clone());
        governor.snapshot().await;
        let record = read_record(&path).unwrap();
        assert_eq!(record.remaining, 1234);

        let reloaded = RateGovernor::new(board.clone(), &config()).with_record(path);
        assert_eq!(reloaded.snapshot().await.unwrap().remaining, 1234);
        assert_eq!(board.rate_limit_calls(), 1);
    }
}
