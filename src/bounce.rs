//! Review-rejection counting and escalation.
//!
//! Every rejection appends `<item>|<timestamp>` to the bounce log. The count
//! for an item is the number of such lines after its most recent
//! `<item>|reset|<timestamp>` line, so concurrent recorders never race on a
//! read-modify-write.

use std::collections::HashMap;

use anyhow::Result;

use crate::board::{ItemId, Status, WorkItem};
use crate::board::writer::StatusWriter;
use crate::errors::BoardError;
use crate::notify::{Escalation, Notifier};
use crate::records::{AppendLog, ItemRecord, item_line};

const RESET_TAG: &str = "reset";

pub struct BounceTracker {
    log: AppendLog,
    max_bounces: u32,
}

impl BounceTracker {
    pub fn new(log: AppendLog, max_bounces: u32) -> Self {
        Self { log, max_bounces }
    }

    pub fn max_bounces(&self) -> u32 {
        self.max_bounces
    }

    /// Record one rejection and return the new count.
    pub fn record(&self, id: ItemId) -> Result<u32> {
        self.log.append(&item_line(id, &[]))?;
        let count = self.count(id)?;
        tracing::info!(item = id, bounces = count, max = self.max_bounces, "Bounce recorded");
        Ok(count)
    }

    pub fn count(&self, id: ItemId) -> Result<u32> {
        Ok(self.counts()?.get(&id).copied().unwrap_or(0))
    }

    /// Counts for every item with at least one bounce since its last reset.
    pub fn counts(&self) -> Result<HashMap<ItemId, u32>> {
        let mut counts: HashMap<ItemId, u32> = HashMap::new();
        for record in self.log.lines()?.iter().filter_map(|l| ItemRecord::parse(l)) {
            if record.is_tagged(RESET_TAG) {
                counts.remove(&record.item);
            } else {
                *counts.entry(record.item).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Zero the count for `id` (used after a human has dealt with it).
    pub fn reset(&self, id: ItemId) -> Result<()> {
        self.log.append(&item_line(id, &[RESET_TAG]))?;
        tracing::info!(item = id, "Bounce count reset");
        Ok(())
    }

    pub fn should_escalate(&self, count: u32) -> bool {
        count >= self.max_bounces
    }

    /// Hand `item` to a human: move it to Need Human and notify once.
    /// Notification failures are logged; the status write is what matters.
    pub async fn escalate(
        &self,
        writer: &StatusWriter,
        notifier: &dyn Notifier,
        item: &WorkItem,
        count: u32,
        reason: &str,
    ) -> Result<(), BoardError> {
        writer.transition(item, Status::NeedHuman).await?;
        tracing::warn!(item = item.id, bounces = count, "Escalated to Need Human");

        let escalation = Escalation {
            item: item.id,
            title: item.title.clone(),
            reason: format!("Rejected {} times in AI review (limit {}). {}", count, self.max_bounces, reason)
                .trim()
                .to_string(),
            url: writer.board().item_url(item.id),
        };
        if let Err(e) = notifier.notify(&escalation).await {
            tracing::warn!(item = item.id, error = %format!("{:#}", e), "Escalation notification failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StatusCache;
    use std::sync::Arc;
    use crate::retry::RetryConfig;
    use crate::testing::{MemoryBoard, RecordingNotifier};
    use std::time::Duration;
    use tempfile::tempdir;

    fn tracker(dir: &std::path::Path) -> BounceTracker {
        BounceTracker::new(AppendLog::new(dir.join("bounces.log")), 2)
    }

    #[test]
    fn count_equals_number_of_records() {
        let dir = tempdir().unwrap();
        let t = tracker(dir.path());
        assert_eq!(t.count(7).unwrap(), 0);
        let mut last = 0;
        for expected in 1..=5 {
            let n = t.record(7).unwrap();
            assert_eq!(n, expected);
            assert!(n >= last);
            last = n;
        }
        assert_eq!(t.count(8).unwrap(), 0);
    }

    #[test]
    fn counts_are_per_item() {
        let dir = tempdir().unwrap();
        let t = tracker(dir.path());
        t.record(1).unwrap();
        t.record(2).unwrap();
        t.record(1).unwrap();
        let counts = t.counts().unwrap();
        assert_eq!(counts[&1], 2);
        assert_eq!(counts[&2], 1);
    }

    #[test]
    fn reset_zeroes_only_that_item() {
        let dir = tempdir().unwrap();
        let t = tracker(dir.path());
        t.record(1).unwrap();
        t.record(1).unwrap();
        t.record(2).unwrap();
        t.reset(1).unwrap();
        assert_eq!(t.count(1).unwrap(), 0);
        assert_eq!(t.count(2).unwrap(), 1);
        assert_eq!(t.record(1).unwrap(), 1);
    }

    #[test]
    fn concurrent_records_are_all_counted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bounces.log");
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let t = BounceTracker::new(AppendLog::new(path.clone()), 2);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        t.record(99).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let t = BounceTracker::new(AppendLog::new(path), 2);
        assert_eq!(t.count(99).unwrap(), 40);
    }

    #[test]
    fn threshold_is_inclusive() {
        let dir = tempdir().unwrap();
        let t = tracker(dir.path());
        assert!(!t.should_escalate(1));
        assert!(t.should_escalate(2));
        assert!(t.should_escalate(3));
    }

    #[tokio::test]
    async fn escalate_moves_to_need_human_and_notifies() {
        let dir = tempdir().unwrap();
        let notifier = RecordingNotifier::new();
        let t = tracker(dir.path());

        let board = Arc::new(MemoryBoard::new());
        let item = WorkItem::new(7, Status::AiReview, "Flaky login");
        board.insert(item.clone());
        let cache = Arc::new(StatusCache::new(board.clone(), Duration::from_secs(60)));
        let writer = StatusWriter::new(board.clone(), cache, RetryConfig::immediate(1));

        t.escalate(&writer, &notifier, &item, 2, "Tests still fail").await.unwrap();
        assert_eq!(board.status_of(7), Some(Status::NeedHuman));
        let sent = notifier.escalations();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].item, 7);
        assert!(sent[0].reason.contains("Rejected 2 times"));
        assert!(sent[0].url.contains("7"));
    }

    #[tokio::test]
    async fn failed_notification_does_not_fail_escalation() {
        let dir = tempdir().unwrap();
        let t = tracker(dir.path());
        let notifier = RecordingNotifier::failing();
        let board = Arc::new(MemoryBoard::new());
        let item = WorkItem::new(3, Status::AiReview, "x");
        board.insert(item.clone());
        let cache = Arc::new(StatusCache::new(board.clone(), Duration::from_secs(60)));
        let writer = StatusWriter::new(board.clone(), cache, RetryConfig::immediate(1));
        assert!(t.escalate(&writer, &notifier, &item, 2, "").await.is_ok());
        assert_eq!(board.status_of(3), Some(Status::NeedHuman));
    }
}
