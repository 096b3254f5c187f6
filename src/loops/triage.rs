use std::sync::Arc;

use anyhow::Result;

use super::{LoopContext, dispatch_for};
use crate::agent::{AgentOutcome, Marker, Phase, prompts};
use crate::board::{Status, WorkItem};

/// Adopt unstatused items into Triage, then dispatch triage for as many
/// Triage items as the pool has room for.
pub async fn cycle(ctx: &Arc<LoopContext>) -> Result<usize> {
    let mut acted = 0;

    for item in ctx.cache.list_by_status(Status::NoStatus).await? {
        match ctx.writer.transition(&item, Status::Triage).await {
            Ok(()) => {
                tracing::info!(item = item.id, title = %item.title, "Adopted new item into Triage");
                acted += 1;
            }
            Err(e) => tracing::warn!(item = item.id, error = %e, "Failed to adopt item"),
        }
    }

    let pool = ctx.pools.get(Phase::Triage);
    pool.reap_exited();
    let mut slots = pool.free_slots();
    if slots == 0 {
        return Ok(acted);
    }

    for item in ctx.cache.list_by_status(Status::Triage).await? {
        if slots == 0 {
            break;
        }
        if pool.is_active(item.id) || ctx.is_held(item.id) {
            continue;
        }
        let detail = match ctx.item_detail(item.id).await {
            Ok(detail) => detail,
            Err(e) => {
                tracing::warn!(item = item.id, error = %e, "Skipping triage, detail unavailable");
                continue;
            }
        };
        let prompt = prompts::triage(&item, &detail);
        match dispatch_for(ctx, Phase::Triage, &item, prompt, ctx.paths.project_dir.clone(), apply) {
            Ok(()) => {
                slots -= 1;
                acted += 1;
            }
            Err(e) => tracing::warn!(item = item.id, error = %e, "Triage dispatch refused"),
        }
    }

    Ok(acted)
}

async fn apply(ctx: Arc<LoopContext>, item: WorkItem, outcome: AgentOutcome) -> Result<()> {
    let AgentOutcome::Recognized { marker, rationale } = outcome else {
        return Ok(());
    };
    let to = match marker {
        Marker::Todo => Status::Todo,
        Marker::Planning => Status::Planning,
        Marker::NeedHuman => Status::NeedHuman,
        Marker::Closed => Status::Done,
        other => anyhow::bail!("{} is not a triage result", other.as_str()),
    };

    ctx.writer.transition(&item, to).await?;
    if let Some(rationale) = rationale {
        ctx.comment(item.id, &format!("**Triage: {}**\n\n{}", marker.as_str(), rationale))
            .await;
    }
    Ok(())
}
