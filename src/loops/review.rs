use std::sync::Arc;

use anyhow::Result;

use super::{LoopContext, dispatch_for};
use crate::agent::{AgentOutcome, Marker, Phase, prompts};
use crate::board::{Status, WorkItem};
use crate::errors::WorkspaceError;
use crate::retry::retry_transient;

const CONFLICT_NOTE: &str = "This branch no longer rebases cleanly onto trunk. Rebase it, resolve the conflicts, and push again.";

pub async fn cycle(ctx: &Arc<LoopContext>) -> Result<usize> {
    let pool = ctx.pools.get(Phase::Review);
    pool.reap_exited();
    let mut slots = pool.free_slots();
    let mut acted = 0;

    for item in ctx.cache.list_by_status(Status::AiReview).await? {
        if slots == 0 {
            break;
        }
        if pool.is_active(item.id) || ctx.is_held(item.id) {
            continue;
        }
        if ctx.workspaces.review_path(item.id).exists() {
            tracing::debug!(item = item.id, "Review workspace already exists, skipping");
            continue;
        }

        let branch = ctx.workspaces.branch_for(item.id);
        let change_request = match retry_transient("change request lookup", &ctx.config.retry, || {
            ctx.board.change_request_for_branch(&branch)
        })
        .await
        {
            Ok(Some(cr)) => cr,
            Ok(None) => {
                tracing::warn!(item = item.id, branch = %branch, "In AI Review without an open change request");
                continue;
            }
            Err(e) => {
                tracing::warn!(item = item.id, error = %e, "Change request lookup failed");
                continue;
            }
        };
        let detail = match ctx.item_detail(item.id).await {
            Ok(detail) => detail,
            Err(e) => {
                tracing::warn!(item = item.id, error = %e, "Skipping review, detail unavailable");
                continue;
            }
        };

        let ws = match ctx.workspaces.create_for_review(item.id, &branch).await {
            Ok(ws) => ws,
            Err(WorkspaceError::AlreadyExists { .. }) => continue,
            Err(WorkspaceError::RebaseConflict { .. }) => {
                tracing::warn!(item = item.id, "Change request conflicts with trunk, returning to implementation");
                if let Err(e) = ctx.board.request_changes(change_request.number, CONFLICT_NOTE).await {
                    tracing::warn!(item = item.id, error = %e, "Failed to request changes");
                }
                ctx.writer.transition(&item, Status::Rejected).await?;
                acted += 1;
                continue;
            }
            Err(e) => {
                tracing::warn!(item = item.id, error = %e, "Failed to prepare review workspace");
                continue;
            }
        };

        let bounces = ctx.bounces.count(item.id)?;
        let prompt = prompts::review(&item, &detail, &change_request, &ws.base_ref, bounces);
        let number = change_request.number;
        let result = dispatch_for(ctx, Phase::Review, &item, prompt, ws.path.clone(), move |ctx, item, outcome| {
            apply(ctx, item, number, outcome)
        });
        match result {
            Ok(()) => {
                slots -= 1;
                acted += 1;
            }
            Err(e) => {
                tracing::warn!(item = item.id, error = %e, "Review dispatch refused, releasing workspace");
                ctx.workspaces.remove_review(item.id).await;
            }
        }
    }

    Ok(acted)
}

async fn apply(ctx: Arc<LoopContext>, item: WorkItem, change_request: u64, outcome: AgentOutcome) -> Result<()> {
    let result = decide(&ctx, &item, change_request, outcome).await;
    ctx.workspaces.remove_review(item.id).await;
    result
}

async fn decide(ctx: &LoopContext, item: &WorkItem, change_request: u64, outcome: AgentOutcome) -> Result<()> {
    let AgentOutcome::Recognized { marker, rationale } = outcome else {
        return Ok(());
    };
    let retry = &ctx.config.retry;

    match marker {
        Marker::Approved => {
            let body = rationale.as_deref().unwrap_or("Approved in AI review.");
            retry_transient("approve", retry, || ctx.board.approve_change_request(change_request, body)).await?;
            match retry_transient("merge", retry, || ctx.board.merge_change_request(change_request)).await {
                Ok(()) => {
                    ctx.writer.transition(item, Status::Done).await?;
                    tracing::info!(item = item.id, change_request, "Merged");
                }
                Err(e) => {
                    tracing::warn!(item = item.id, change_request, error = %e, "Merge failed, handing to human review");
                    ctx.writer.transition(item, Status::InReview).await?;
                    ctx.comment(item.id, &format!("Approved in AI review but the merge failed: {}", e))
                        .await;
                }
            }
            ctx.workspaces.cleanup_item(item.id).await;
        }
        Marker::Rejected => {
            let reason = rationale.unwrap_or_else(|| "Rejected in AI review.".to_string());
            retry_transient("request changes", retry, || ctx.board.request_changes(change_request, &reason)).await?;

            let count = ctx.bounces.record(item.id)?;
            if ctx.bounces.should_escalate(count) {
                ctx.bounces.escalate(&ctx.writer, ctx.notifier.as_ref(), item, count, &reason).await?;
            } else {
                ctx.writer.transition(item, Status::Rejected).await?;
                tracing::info!(item = item.id, bounces = count, limit = ctx.bounces.max_bounces(), "Bounced back to implementation");
            }
            ctx.workspaces.cleanup_item(item.id).await;
        }
        other => anyhow::bail!("{} is not a review result", other.as_str()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::testing::Harness;

    fn in_review(t: &TestLoop, id: u64) {
        t.harness.board.insert(WorkItem::new(id, Status::AiReview, "Fix the thing"));
        let branch = format!("fix/issue-{}", id);
        t.harness.vcs.add_remote_branch(&branch);
        t.harness.board.open_change_request(&branch, false);
    }

    #[tokio::test]
    async fn approval_merges_and_finishes() {
        let t = context(Harness::new());
        in_review(&t, 20);
        t.harness.agent.script(20, "RATIONALE: looks good\nREVIEW_RESULT=APPROVED\n");

        assert_eq!(cycle(&t.ctx).await.unwrap(), 1);
        settle(&t.ctx).await;

        let cr = t.harness.board.approvals()[0];
        assert!(t.harness.board.is_merged(cr));
        assert_eq!(t.harness.board.status_of(20), Some(Status::Done));
        assert!(!t.ctx.workspaces.review_path(20).exists());
    }

    #[tokio::test]
    async fn rejection_below_limit_bounces_to_rejected() {
        let t = context(Harness::new());
        in_review(&t, 21);
        t.harness.agent.script(21, "RATIONALE: missing tests\nREVIEW_RESULT=REJECTED\n");

        cycle(&t.ctx).await.unwrap();
        settle(&t.ctx).await;

        assert_eq!(t.harness.board.status_of(21), Some(Status::Rejected));
        assert_eq!(t.ctx.bounces.count(21).unwrap(), 1);
        let requested = t.harness.board.requested_changes();
        assert_eq!(requested.len(), 1);
        assert!(requested[0].1.contains("missing tests"));
        assert!(t.harness.notifier.escalations().is_empty());
    }

    #[tokio::test]
    async fn second_rejection_escalates_once() {
        let t = context(Harness::new());
        in_review(&t, 7);
        t.ctx.bounces.record(7).unwrap();
        t.harness.agent.script(7, "RATIONALE: still broken\nREVIEW_RESULT=REJECTED\n");

        cycle(&t.ctx).await.unwrap();
        settle(&t.ctx).await;

        assert_eq!(t.harness.board.status_of(7), Some(Status::NeedHuman));
        assert_eq!(t.ctx.bounces.count(7).unwrap(), 2);
        assert_eq!(t.harness.notifier.escalations().len(), 1);

        // Need Human is outside every loop's view: nothing more happens.
        assert_eq!(cycle(&t.ctx).await.unwrap(), 0);
        assert_eq!(t.harness.notifier.escalations().len(), 1);
    }

    #[tokio::test]
    async fn rebase_conflict_returns_item_without_a_bounce() {
        let t = context(Harness::new());
        in_review(&t, 22);
        t.harness.vcs.conflict_on_rebase(true);

        assert_eq!(cycle(&t.ctx).await.unwrap(), 1);
        assert_eq!(t.harness.board.status_of(22), Some(Status::Rejected));
        assert_eq!(t.ctx.bounces.count(22).unwrap(), 0);
        assert!(t.harness.agent.requests().is_empty());
        assert!(!t.ctx.workspaces.review_path(22).exists());
    }

    #[tokio::test]
    async fn unclear_review_holds_and_releases_workspace() {
        let t = context(Harness::new());
        in_review(&t, 23);
        t.harness.agent.script(23, "REVIEW_RESULT=APPROVED\nREVIEW_RESULT=REJECTED\n");

        cycle(&t.ctx).await.unwrap();
        settle(&t.ctx).await;

        assert_eq!(t.harness.board.status_of(23), Some(Status::AiReview));
        assert!(t.ctx.is_held(23));
        assert!(!t.ctx.workspaces.review_path(23).exists());
        assert!(t.harness.board.approvals().is_empty());
    }
}
