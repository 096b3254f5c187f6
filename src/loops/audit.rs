use std::sync::Arc;

use anyhow::Result;

use super::LoopContext;
use crate::agent::{Phase, prompts};
use crate::board::{ItemId, Status};

/// Audit invocations are not tied to an item; they run under this id.
pub const AUDIT_ITEM: ItemId = 0;

/// Dispatch a codebase audit when the backlog has run low and nothing is
/// waiting for triage.
pub async fn cycle(ctx: &Arc<LoopContext>) -> Result<usize> {
    let pool = ctx.pools.get(Phase::Audit);
    pool.reap_exited();
    if pool.free_slots() == 0 || pool.is_active(AUDIT_ITEM) {
        return Ok(0);
    }

    let snapshot = ctx.cache.snapshot().await?;
    let count = |status: Status| snapshot.by_status(status).len();
    let triage = count(Status::Triage);
    let backlog = triage + count(Status::Todo) + count(Status::Planning);
    let floor = ctx.config.policy.audit_backlog_floor;
    if triage > 0 || backlog > floor {
        tracing::debug!(backlog, floor, triage, "Backlog healthy, no audit");
        return Ok(0);
    }

    let titles: Vec<(Status, Vec<String>)> = Status::ALL
        .into_iter()
        .filter(|status| *status != Status::Done)
        .map(|status| {
            let titles = snapshot.by_status(status).into_iter().map(|item| item.title).collect();
            (status, titles)
        })
        .collect();
    let prompt = prompts::audit(&titles);
    let request = ctx.agent_request(Phase::Audit, AUDIT_ITEM, prompt, ctx.paths.project_dir.clone());

    let handler_ctx = Arc::clone(ctx);
    pool.dispatch(request, move |result| async move {
        match result {
            Ok(exit) if exit.success => tracing::info!("Audit finished"),
            Ok(exit) => tracing::warn!(code = ?exit.code, "Audit exited unsuccessfully"),
            Err(e) => tracing::warn!(error = %e, "Audit failed"),
        }
        // New items land in No Status; pick them up on the next triage pass.
        handler_ctx.cache.invalidate().await;
    })?;
    tracing::info!(backlog, floor, "Backlog low, audit dispatched");
    Ok(1)
}
