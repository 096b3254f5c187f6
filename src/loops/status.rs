use std::sync::Arc;

use anyhow::Result;

use super::LoopContext;
use crate::board::Status;

/// One-line board summary in canonical order, e.g. `Triage=2 Planning=0 ...`.
/// Unstatused items are only mentioned when there are some.
pub fn board_summary(counts: &[(Status, usize)]) -> String {
    counts
        .iter()
        .filter(|(status, count)| *status != Status::NoStatus || *count > 0)
        .map(|(status, count)| format!("{}={}", status, count))
        .collect::<Vec<_>>()
        .join(" ")
}

pub async fn cycle(ctx: &Arc<LoopContext>) -> Result<usize> {
    let counts = ctx.cache.counts().await?;
    let pools = ctx
        .pools
        .usage()
        .into_iter()
        .map(|(phase, active, capacity)| format!("{}={}/{}", phase, active, capacity))
        .collect::<Vec<_>>()
        .join(" ");
    let held = ctx.holds.held().map(|h| h.len()).unwrap_or(0);

    tracing::info!(board = %board_summary(&counts), pools = %pools, held, "Status");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_follows_canonical_order() {
        let counts = vec![
            (Status::Triage, 2),
            (Status::Todo, 1),
            (Status::Done, 4),
            (Status::NoStatus, 0),
        ];
        assert_eq!(board_summary(&counts), "Triage=2 Todo=1 Done=4");
    }

    #[test]
    fn unstatused_items_are_reported() {
        let counts = vec![(Status::Triage, 0), (Status::NoStatus, 3)];
        assert_eq!(board_summary(&counts), "Triage=0 No Status=3");
    }
}
