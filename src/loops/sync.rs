use std::sync::Arc;

use anyhow::Result;

use super::LoopContext;

/// Drop the cached snapshot and fetch a fresh one so the other loops start
/// their next cycle from current board state.
pub async fn cycle(ctx: &Arc<LoopContext>) -> Result<usize> {
    ctx.cache.invalidate().await;
    let snapshot = ctx.cache.snapshot().await?;
    tracing::debug!(items = snapshot.items.len(), "Board synced");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::board::{Status, WorkItem};
    use crate::testing::Harness;

    #[tokio::test]
    async fn refetches_every_cycle() {
        let t = context(Harness::new());
        t.harness.board.insert(WorkItem::new(1, Status::Todo, "x"));

        cycle(&t.ctx).await.unwrap();
        t.harness.board.force_status(1, Status::Done);
        cycle(&t.ctx).await.unwrap();

        assert_eq!(t.harness.board.list_calls(), 2);
        let item = t.ctx.cache.get(1).await.unwrap().unwrap();
        assert_eq!(item.status, Status::Done);
    }
}
