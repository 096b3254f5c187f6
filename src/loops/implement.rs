use std::sync::Arc;

use anyhow::Result;

use super::{LoopContext, dispatch_for};
use crate::agent::{AgentOutcome, Marker, Phase, prompts};
use crate::board::{Status, WorkItem};
use crate::errors::WorkspaceError;
use crate::retry::retry_transient;

/// Rejected items first (oldest id first), then Todo by priority label and id.
pub fn implementation_order(mut rejected: Vec<WorkItem>, mut todo: Vec<WorkItem>) -> Vec<WorkItem> {
    rejected.sort_by_key(|item| item.id);
    todo.sort_by_key(|item| (item.priority_weight(), item.id));
    rejected.extend(todo);
    rejected
}

pub async fn cycle(ctx: &Arc<LoopContext>) -> Result<usize> {
    let pool = ctx.pools.get(Phase::Implement);
    pool.reap_exited();
    let mut slots = pool.free_slots();
    if slots == 0 {
        return Ok(0);
    }

    let candidates = implementation_order(
        ctx.cache.list_by_status(Status::Rejected).await?,
        ctx.cache.list_by_status(Status::Todo).await?,
    );

    let mut acted = 0;
    for item in candidates {
        if slots == 0 {
            break;
        }
        if pool.is_active(item.id) || ctx.is_held(item.id) {
            continue;
        }
        if ctx.workspaces.exists(item.id) {
            tracing::debug!(item = item.id, "Implementation workspace already exists, skipping");
            continue;
        }

        let detail = match ctx.item_detail(item.id).await {
            Ok(detail) => detail,
            Err(e) => {
                tracing::warn!(item = item.id, error = %e, "Skipping implementation, detail unavailable");
                continue;
            }
        };

        let ws = match ctx.workspaces.create_for_implementation(&item).await {
            Ok(ws) => ws,
            Err(WorkspaceError::AlreadyExists { .. }) => continue,
            Err(e) => {
                tracing::warn!(item = item.id, error = %e, "Failed to prepare implementation workspace");
                continue;
            }
        };

        // In Progress must land before the agent can report a result.
        if let Err(e) = ctx.writer.transition(&item, Status::InProgress).await {
            tracing::warn!(item = item.id, error = %e, "Failed to mark item In Progress, releasing workspace");
            ctx.workspaces.remove(&ws.workspace.path).await;
            continue;
        }
        let mut dispatched = item.clone();
        dispatched.status = Status::InProgress;

        let prompt = prompts::implement(&item, &detail, &ws.workspace.branch, &ws.change_request);
        if let Err(e) = dispatch_for(ctx, Phase::Implement, &dispatched, prompt, ws.workspace.path.clone(), apply) {
            tracing::warn!(item = item.id, error = %e, "Implementation dispatch refused, releasing workspace");
            ctx.workspaces.remove(&ws.workspace.path).await;
            continue;
        }
        slots -= 1;
        acted += 1;
    }

    Ok(acted)
}

async fn apply(ctx: Arc<LoopContext>, item: WorkItem, outcome: AgentOutcome) -> Result<()> {
    let AgentOutcome::Recognized { marker, rationale } = outcome else {
        return Ok(());
    };

    match marker {
        Marker::Implemented => {
            tracing::info!(item = item.id, "Implementation finished, waiting for the change request to be marked ready");
        }
        Marker::Unnecessary => {
            ctx.writer.transition(&item, Status::Done).await?;
            let branch = ctx.workspaces.branch_for(item.id);
            let open = retry_transient("change request lookup", &ctx.config.retry, || {
                ctx.board.change_request_for_branch(&branch)
            })
            .await?;
            if let Some(cr) = open {
                let note = rationale.as_deref().unwrap_or("No change needed.");
                ctx.board.close_change_request(cr.number, note).await?;
            }
            ctx.workspaces.remove_implementation(item.id).await;
        }
        Marker::NeedsPlanning => {
            ctx.writer.transition(&item, Status::Planning).await?;
            if let Some(rationale) = &rationale {
                ctx.comment(item.id, &format!("**Sent back to planning**\n\n{}", rationale))
                    .await;
            }
            ctx.workspaces.remove_implementation(item.id).await;
        }
        other => anyhow::bail!("{} is not an implementation result", other.as_str()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::testing::{Harness, VcsCall};
    use std::time::Duration;

    #[test]
    fn rejected_first_then_priority() {
        let rejected = vec![
            WorkItem::new(9, Status::Rejected, "r9"),
            WorkItem::new(4, Status::Rejected, "r4"),
        ];
        let todo = vec![
            WorkItem::new(1, Status::Todo, "plain"),
            WorkItem::new(2, Status::Todo, "urgent").with_labels(&["priority: high"]),
            WorkItem::new(3, Status::Todo, "later").with_labels(&["priority: low"]),
        ];
        let order: Vec<_> = implementation_order(rejected, todo).iter().map(|i| i.id).collect();
        assert_eq!(order, vec![4, 9, 2, 1, 3]);
    }

    #[tokio::test]
    async fn dispatch_creates_workspace_and_marks_in_progress() {
        let t = context(Harness::new());
        t.harness.board.insert(WorkItem::new(42, Status::Todo, "Login fails"));
        t.harness.agent.script(42, "RESULT=IMPLEMENTED\n");

        assert_eq!(cycle(&t.ctx).await.unwrap(), 1);
        settle(&t.ctx).await;

        assert_eq!(t.harness.board.status_of(42), Some(Status::InProgress));
        assert!(t.ctx.workspaces.exists(42));
        let cr = t.harness.board.change_request("fix/issue-42").unwrap();
        assert!(cr.is_draft);
        assert_eq!(
            t.harness.board.change_request_title(cr.number).as_deref(),
            Some("Fix #42: Login fails")
        );
        let requests = t.harness.agent.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].workdir, t.ctx.workspaces.implementation_path(42));

        // The workspace still exists, so the next cycle leaves the item alone.
        t.harness.board.force_status(42, Status::Todo);
        t.ctx.cache.invalidate().await;
        assert_eq!(cycle(&t.ctx).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn respects_pool_capacity() {
        let t = context_with(Harness::new(), |c| c.pools.implement = 2);
        for id in 1..=4 {
            t.harness.board.insert(WorkItem::new(id, Status::Todo, "x"));
        }
        assert_eq!(cycle(&t.ctx).await.unwrap(), 2);
        let in_progress = (1..=4)
            .filter(|id| t.harness.board.status_of(*id) == Some(Status::InProgress))
            .count();
        assert_eq!(in_progress, 2);
        settle(&t.ctx).await;
    }

    #[tokio::test]
    async fn unnecessary_closes_change_request_and_cleans_up() {
        let t = context(Harness::new());
        t.harness.board.insert(WorkItem::new(8, Status::Todo, "Already works"));
        t.harness.agent.script(8, "RATIONALE: fixed upstream\nRESULT=UNNECESSARY\n");

        cycle(&t.ctx).await.unwrap();
        settle(&t.ctx).await;

        assert_eq!(t.harness.board.status_of(8), Some(Status::Done));
        assert!(t.harness.board.change_request("fix/issue-8").is_none());
        assert!(!t.ctx.workspaces.exists(8));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fast_result_is_not_overwritten_by_slow_status_write() {
        let t = context(Harness::new());
        t.harness.board.insert(WorkItem::new(8, Status::Todo, "Already works"));
        t.harness.board.delay_set_status(Duration::from_millis(50));
        t.harness.agent.script(8, "RESULT=UNNECESSARY\n");

        cycle(&t.ctx).await.unwrap();
        settle(&t.ctx).await;

        assert_eq!(t.harness.board.status_of(8), Some(Status::Done));
        assert_eq!(
            t.harness.board.status_history(),
            vec![(8, Status::InProgress), (8, Status::Done)]
        );
    }

    #[tokio::test]
    async fn failed_status_write_skips_item_and_releases_workspace() {
        let t = context(Harness::new());
        t.harness.board.insert(WorkItem::new(5, Status::Todo, "x"));
        t.harness.board.fail_set_status(10);

        assert_eq!(cycle(&t.ctx).await.unwrap(), 0);
        assert_eq!(t.harness.board.status_of(5), Some(Status::Todo));
        assert!(!t.ctx.workspaces.exists(5));
        assert!(t.harness.agent.requests().is_empty());
    }

    #[tokio::test]
    async fn needs_planning_returns_item_to_planning() {
        let t = context(Harness::new());
        t.harness.board.insert(WorkItem::new(9, Status::Todo, "Huge"));
        t.harness.agent.script(9, "RESULT=NEEDS_PLANNING\n");

        cycle(&t.ctx).await.unwrap();
        settle(&t.ctx).await;

        assert_eq!(t.harness.board.status_of(9), Some(Status::Planning));
        assert!(!t.ctx.workspaces.exists(9));
    }

    #[tokio::test]
    async fn workspace_failure_leaves_item_in_todo() {
        let t = context(Harness::new());
        t.harness.board.insert(WorkItem::new(3, Status::Todo, "x"));
        t.harness.vcs.fail_push(true);

        assert_eq!(cycle(&t.ctx).await.unwrap(), 0);
        assert_eq!(t.harness.board.status_of(3), Some(Status::Todo));
        assert!(!t.ctx.workspaces.exists(3));
        assert!(t.harness.agent.requests().is_empty());
    }

    #[tokio::test]
    async fn rejected_item_reuses_its_branch() {
        let t = context(Harness::new());
        t.harness.board.insert(WorkItem::new(7, Status::Rejected, "Flaky test"));
        t.harness.vcs.add_remote_branch("fix/issue-7");
        t.harness.board.open_change_request("fix/issue-7", false);
        t.harness.agent.script(7, "RESULT=IMPLEMENTED\n");

        cycle(&t.ctx).await.unwrap();
        settle(&t.ctx).await;

        assert_eq!(t.harness.board.status_of(7), Some(Status::InProgress));
        assert!(t.harness.vcs.calls().iter().any(|c| matches!(
            c,
            VcsCall::AddWorktree { branch, start } if branch == "fix/issue-7" && start == "origin/fix/issue-7"
        )));
        assert!(t.harness.agent.requests()[0].prompt.contains("rejected in review"));
    }
}
