use std::sync::Arc;

use anyhow::Result;

use super::{LoopContext, dispatch_for};
use crate::agent::{AgentOutcome, Marker, Phase, prompts};
use crate::board::{Status, WorkItem};
use crate::notify::Escalation;

pub async fn cycle(ctx: &Arc<LoopContext>) -> Result<usize> {
    let pool = ctx.pools.get(Phase::Planning);
    pool.reap_exited();
    let mut slots = pool.free_slots();
    let mut acted = 0;

    for item in ctx.cache.list_by_status(Status::Planning).await? {
        if slots == 0 {
            break;
        }
        if pool.is_active(item.id) || ctx.is_held(item.id) {
            continue;
        }
        let detail = match ctx.item_detail(item.id).await {
            Ok(detail) => detail,
            Err(e) => {
                tracing::warn!(item = item.id, error = %e, "Skipping planning, detail unavailable");
                continue;
            }
        };
        let prompt = prompts::planning(&item, &detail);
        match dispatch_for(ctx, Phase::Planning, &item, prompt, ctx.paths.project_dir.clone(), apply) {
            Ok(()) => {
                slots -= 1;
                acted += 1;
            }
            Err(e) => tracing::warn!(item = item.id, error = %e, "Planning dispatch refused"),
        }
    }

    Ok(acted)
}

async fn apply(ctx: Arc<LoopContext>, item: WorkItem, outcome: AgentOutcome) -> Result<()> {
    let AgentOutcome::Recognized { marker, rationale } = outcome else {
        return Ok(());
    };

    match marker {
        Marker::Revised => ctx.writer.transition(&item, Status::Todo).await?,
        Marker::Closed => ctx.writer.transition(&item, Status::Done).await?,
        Marker::Escalate => {
            ctx.writer.transition(&item, Status::NeedHuman).await?;
            let escalation = Escalation {
                item: item.id,
                title: item.title.clone(),
                reason: rationale
                    .clone()
                    .unwrap_or_else(|| "Planning needs a human decision".to_string()),
                url: ctx.board.item_url(item.id),
            };
            if let Err(e) = ctx.notifier.notify(&escalation).await {
                tracing::warn!(item = item.id, error = %format!("{:#}", e), "Escalation notification failed");
            }
        }
        other => anyhow::bail!("{} is not a planning result", other.as_str()),
    }

    if let Some(rationale) = rationale {
        ctx.comment(item.id, &format!("**Planning: {}**\n\n{}", marker.as_str(), rationale))
            .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::testing::Harness;

    #[tokio::test]
    async fn revised_goes_to_todo_and_closed_to_done() {
        let t = context(Harness::new());
        t.harness.board.insert(WorkItem::new(10, Status::Planning, "Split the parser"));
        t.harness.board.insert(WorkItem::new(11, Status::Planning, "Old idea"));
        t.harness.agent.script(10, "PLAN_RESULT=REVISED\n");
        t.harness.agent.script(11, "PLAN_RESULT=CLOSED\n");

        assert_eq!(cycle(&t.ctx).await.unwrap(), 2);
        settle(&t.ctx).await;

        assert_eq!(t.harness.board.status_of(10), Some(Status::Todo));
        assert_eq!(t.harness.board.status_of(11), Some(Status::Done));
        assert!(t.harness.notifier.escalations().is_empty());
    }

    #[tokio::test]
    async fn escalate_moves_to_need_human_and_notifies() {
        let t = context(Harness::new());
        t.harness.board.insert(WorkItem::new(12, Status::Planning, "Pick a database"));
        t.harness
            .agent
            .script(12, "RATIONALE: product call between two vendors\nPLAN_RESULT=ESCALATE\n");

        cycle(&t.ctx).await.unwrap();
        settle(&t.ctx).await;

        assert_eq!(t.harness.board.status_of(12), Some(Status::NeedHuman));
        let sent = t.harness.notifier.escalations();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].item, 12);
        assert!(sent[0].reason.contains("two vendors"));
    }
}
