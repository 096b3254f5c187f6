//! Phase loops.
//!
//! Every loop is an independent tokio task that polls on its own interval:
//! check for stop, wait out the rate governor, run one cycle, sleep. Cycle
//! errors are logged and the loop carries on; nothing a cycle does can take
//! the loop down except a panic, which the supervisor notices and restarts.
//!
//! | Loop        | Reads            | Does                                            |
//! |-------------|------------------|-------------------------------------------------|
//! | `sync`      | board            | Refreshes the status cache                      |
//! | `triage`    | No Status, Triage| Adopts new items, dispatches triage             |
//! | `planning`  | Planning         | Dispatches planning                             |
//! | `implement` | Rejected, Todo   | Creates workspaces, dispatches implementation   |
//! | `promote`   | In Progress      | Moves ready change requests to AI Review        |
//! | `review`    | AI Review        | Dispatches review, merges or bounces            |
//! | `audit`     | whole board      | Files new items when the backlog runs low       |
//! | `status`    | whole board      | Logs board and pool summaries                   |

pub mod audit;
pub mod implement;
pub mod planning;
pub mod promote;
pub mod review;
pub mod status;
pub mod sync;
pub mod triage;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::agent::{self, AgentOutcome, AgentPools, AgentRequest, AgentRunner, Phase, parse_outcome};
use crate::board::{Board, ItemDetail, ItemId, StatusWriter, WorkItem};
use crate::bounce::BounceTracker;
use crate::cache::StatusCache;
use crate::config::{DevloopConfig, IntervalsSection, Paths};
use crate::control::StopSignal;
use crate::errors::{BoardError, DispatchError};
use crate::governor::{RateGovernor, WaitOutcome};
use crate::holds::HoldLedger;
use crate::notify::Notifier;
use crate::records::AppendLog;
use crate::retry::retry_transient;
use crate::vcs::Vcs;
use crate::workspace::WorkspaceManager;

/// The scheduler's loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopKind {
    Sync,
    Status,
    Triage,
    Planning,
    Implement,
    Promote,
    Review,
    Audit,
}

impl LoopKind {
    /// Launch order.
    pub const ALL: [LoopKind; 8] = [
        LoopKind::Sync,
        LoopKind::Status,
        LoopKind::Triage,
        LoopKind::Planning,
        LoopKind::Implement,
        LoopKind::Promote,
        LoopKind::Review,
        LoopKind::Audit,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LoopKind::Sync => "sync",
            LoopKind::Status => "status",
            LoopKind::Triage => "triage",
            LoopKind::Planning => "planning",
            LoopKind::Implement => "implement",
            LoopKind::Promote => "promote",
            LoopKind::Review => "review",
            LoopKind::Audit => "audit",
        }
    }

    pub fn interval(&self, intervals: &IntervalsSection) -> Duration {
        let secs = match self {
            LoopKind::Sync => intervals.sync,
            LoopKind::Status => intervals.status,
            LoopKind::Triage => intervals.triage,
            LoopKind::Planning => intervals.planning,
            LoopKind::Implement => intervals.implement,
            LoopKind::Promote => intervals.promote,
            LoopKind::Review => intervals.review,
            LoopKind::Audit => intervals.audit,
        };
        Duration::from_secs(secs)
    }

    /// One pass of this loop. Returns how many items it acted on.
    pub async fn cycle(&self, ctx: &Arc<LoopContext>) -> Result<usize> {
        match self {
            LoopKind::Sync => sync::cycle(ctx).await,
            LoopKind::Status => status::cycle(ctx).await,
            LoopKind::Triage => triage::cycle(ctx).await,
            LoopKind::Planning => planning::cycle(ctx).await,
            LoopKind::Implement => implement::cycle(ctx).await,
            LoopKind::Promote => promote::cycle(ctx).await,
            LoopKind::Review => review::cycle(ctx).await,
            LoopKind::Audit => audit::cycle(ctx).await,
        }
    }
}

impl std::fmt::Display for LoopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for LoopKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LoopKind::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("Unknown loop '{}'", s))
    }
}

/// Everything a loop cycle needs. Shared by all loops and every completion
/// handler.
pub struct LoopContext {
    pub config: DevloopConfig,
    pub paths: Paths,
    pub board: Arc<dyn Board>,
    pub cache: Arc<StatusCache>,
    pub writer: StatusWriter,
    pub governor: RateGovernor,
    pub workspaces: WorkspaceManager,
    pub bounces: BounceTracker,
    pub holds: HoldLedger,
    pub notifier: Arc<dyn Notifier>,
    pub pools: AgentPools,
    pub stop: StopSignal,
}

impl LoopContext {
    /// Wire the scheduler's components around the given collaborators.
    pub fn new(
        config: DevloopConfig,
        paths: Paths,
        board: Arc<dyn Board>,
        vcs: Arc<dyn Vcs>,
        runner: Arc<dyn AgentRunner>,
        notifier: Arc<dyn Notifier>,
        stop: StopSignal,
    ) -> Self {
        let cache = Arc::new(StatusCache::new(Arc::clone(&board), config.cache_ttl()));
        let writer = StatusWriter::new(Arc::clone(&board), Arc::clone(&cache), config.retry.clone());
        let governor =
            RateGovernor::new(Arc::clone(&board), &config.rate_limit).with_record(paths.rate_snapshot.clone());
        let workspaces = WorkspaceManager::new(
            paths.workspace_root.clone(),
            &config.workspace,
            vcs,
            Arc::clone(&board),
            config.retry.clone(),
        );
        let bounces = BounceTracker::new(AppendLog::new(paths.bounce_log.clone()), config.policy.max_bounces);
        let holds = HoldLedger::new(AppendLog::new(paths.hold_log.clone()));
        let pools = AgentPools::new(&config.pools, runner);

        Self {
            config,
            paths,
            board,
            cache,
            writer,
            governor,
            workspaces,
            bounces,
            holds,
            notifier,
            pools,
            stop,
        }
    }

    /// Held items are skipped; an unreadable hold ledger skips everything.
    pub fn is_held(&self, id: ItemId) -> bool {
        match self.holds.is_held(id) {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!(item = id, error = %format!("{:#}", e), "Failed to read hold ledger");
                true
            }
        }
    }

    pub async fn item_detail(&self, id: ItemId) -> Result<ItemDetail, BoardError> {
        retry_transient("item detail", &self.config.retry, || self.board.item_detail(id)).await
    }

    /// Best-effort comment on an item.
    pub async fn comment(&self, id: ItemId, body: &str) {
        if let Err(e) = retry_transient("comment", &self.config.retry, || self.board.add_comment(id, body)).await {
            tracing::warn!(item = id, error = %e, "Failed to comment on item");
        }
    }

    pub fn agent_request(&self, phase: Phase, item: ItemId, prompt: String, workdir: PathBuf) -> AgentRequest {
        AgentRequest {
            phase,
            item,
            prompt,
            workdir,
            log_path: agent::log_path(&self.paths.agent_log_dir, phase, item),
        }
    }
}

/// Dispatch a marker-bearing invocation for `item`. When the agent exits,
/// its transcript is parsed; an unclear outcome parks the item in the hold
/// ledger before `apply` runs, so the next cycle does not retry it.
pub(crate) fn dispatch_for<F, Fut>(
    ctx: &Arc<LoopContext>,
    phase: Phase,
    item: &WorkItem,
    prompt: String,
    workdir: PathBuf,
    apply: F,
) -> Result<(), DispatchError>
where
    F: FnOnce(Arc<LoopContext>, WorkItem, AgentOutcome) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let request = ctx.agent_request(phase, item.id, prompt, workdir);
    let handler_ctx = Arc::clone(ctx);
    let handler_item = item.clone();

    ctx.pools.get(phase).dispatch(request, move |result| async move {
        let id = handler_item.id;
        let outcome = match result {
            Ok(exit) => {
                let outcome = parse_outcome(phase, &exit.transcript);
                if !exit.success && outcome.marker().is_none() {
                    AgentOutcome::Unclear {
                        reason: format!("agent exited with {:?} and no result", exit.code),
                    }
                } else {
                    outcome
                }
            }
            Err(DispatchError::Timeout { secs }) => AgentOutcome::Unclear {
                reason: format!("agent timed out after {}s", secs),
            },
            Err(e) => {
                // Infrastructure failure: nothing was decided, the next cycle may retry.
                tracing::error!(phase = %phase, item = id, error = %e, "Agent did not run");
                return;
            }
        };

        match &outcome {
            AgentOutcome::Recognized { marker, rationale } => {
                tracing::info!(phase = %phase, item = id, marker = marker.as_str(), rationale = ?rationale, "Agent result");
            }
            AgentOutcome::Unclear { reason } => {
                tracing::warn!(phase = %phase, item = id, reason = %reason, "Unclear agent result, leaving item untouched");
                if let Err(e) = handler_ctx.holds.hold(id, phase, reason) {
                    tracing::error!(item = id, error = %format!("{:#}", e), "Failed to record hold");
                }
            }
        }

        if let Err(e) = apply(Arc::clone(&handler_ctx), handler_item, outcome).await {
            tracing::warn!(phase = %phase, item = id, error = %format!("{:#}", e), "Failed to apply agent result");
        }
    })?;
    Ok(())
}

/// Drive `kind` until stop: stop check, rate wait, cycle, sleep.
pub async fn run_loop(kind: LoopKind, ctx: Arc<LoopContext>) {
    let interval = kind.interval(&ctx.config.intervals);
    tracing::info!(loop_name = kind.name(), interval_secs = interval.as_secs(), "Loop started");

    loop {
        if ctx.stop.is_stopped() {
            break;
        }
        if ctx.governor.is_limited().await
            && ctx.governor.wait_until_clear(kind.name(), &ctx.stop).await == WaitOutcome::Aborted
        {
            break;
        }

        match kind.cycle(&ctx).await {
            Ok(0) => tracing::debug!(loop_name = kind.name(), "Cycle idle"),
            Ok(acted) => tracing::info!(loop_name = kind.name(), acted, "Cycle complete"),
            Err(e) => tracing::warn!(loop_name = kind.name(), error = %format!("{:#}", e), "Cycle failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = ctx.stop.stopped() => break,
        }
    }

    tracing::info!(loop_name = kind.name(), "Loop stopped");
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::board::Status;
    use crate::testing::Harness;

    #[test]
    fn loop_names_roundtrip() {
        for kind in LoopKind::ALL {
            assert_eq!(kind.name().parse::<LoopKind>().unwrap(), kind);
        }
        assert!("deploy".parse::<LoopKind>().is_err());
    }

    #[test]
    fn default_intervals() {
        let intervals = IntervalsSection::default();
        assert_eq!(LoopKind::Sync.interval(&intervals), Duration::from_secs(120));
        assert_eq!(LoopKind::Implement.interval(&intervals), Duration::from_secs(60));
        assert_eq!(LoopKind::Promote.interval(&intervals), Duration::from_secs(90));
        assert_eq!(LoopKind::Audit.interval(&intervals), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn unclear_result_holds_the_item() {
        let t = context(Harness::new());
        let item = WorkItem::new(12, Status::Triage, "Vague");
        t.harness.board.insert(item.clone());
        t.harness.agent.script(12, "I am not sure what to do here.");

        dispatch_for(&t.ctx, Phase::Triage, &item, String::new(), t.dir.path().to_path_buf(), |_, _, _| async {
            Ok(())
        })
        .unwrap();
        settle(&t.ctx).await;

        assert!(t.ctx.is_held(12));
        assert_eq!(t.harness.board.status_of(12), Some(Status::Triage));
    }

    #[tokio::test]
    async fn spawn_failure_does_not_hold() {
        let t = context(Harness::new());
        let item = WorkItem::new(13, Status::Triage, "x");
        t.harness.board.insert(item.clone());
        t.harness.agent.fail(13);

        dispatch_for(&t.ctx, Phase::Triage, &item, String::new(), t.dir.path().to_path_buf(), |_, _, _| async {
            Ok(())
        })
        .unwrap();
        settle(&t.ctx).await;
        assert!(!t.ctx.is_held(13));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_blocks_while_rate_limited_and_exits_on_stop() {
        let t = context(Harness::new());
        t.harness.board.insert(WorkItem::new(1, Status::NoStatus, "new"));
        t.harness.board.set_remaining(500);

        let handle = tokio::spawn(run_loop(LoopKind::Triage, Arc::clone(&t.ctx)));
        tokio::time::sleep(Duration::from_secs(30)).await;
        // Limited: no cycle has run, so the item was not adopted.
        assert_eq!(t.harness.board.status_of(1), Some(Status::NoStatus));

        t.harness.board.set_remaining(5000);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(t.harness.board.status_of(1), Some(Status::Triage));

        t.ctx.stop.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
