use std::sync::Arc;

use anyhow::Result;

use super::LoopContext;
use crate::agent::Phase;
use crate::board::Status;
use crate::retry::retry_transient;

/// Move In Progress items whose change request has left draft into AI Review.
/// Items with a live implementation invocation are left alone.
pub async fn cycle(ctx: &Arc<LoopContext>) -> Result<usize> {
    let implementing = ctx.pools.get(Phase::Implement);
    let mut acted = 0;

    for item in ctx.cache.list_by_status(Status::InProgress).await? {
        if implementing.is_active(item.id) || ctx.is_held(item.id) {
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
                tracing::debug!(item = item.id, branch = %branch, "No open change request yet");
                continue;
            }
            Err(e) => {
                tracing::warn!(item = item.id, error = %e, "Change request lookup failed");
                continue;
            }
        };
        if change_request.is_draft {
            continue;
        }

        match ctx.writer.transition(&item, Status::AiReview).await {
            Ok(()) => {
                tracing::info!(item = item.id, change_request = change_request.number, "Promoted to AI Review");
                ctx.workspaces.remove_implementation(item.id).await;
                acted += 1;
            }
            Err(e) => tracing::warn!(item = item.id, error = %e, "Failed to promote item"),
        }
    }

    Ok(acted)
}
