//! The scheduler itself: `devloop run`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use devloop::agent::CliAgentRunner;
use devloop::board::GhBoard;
use devloop::control::StopSignal;
use devloop::loops::{LoopContext, LoopKind};
use devloop::supervisor::{ExitReason, Supervisor};
use devloop::vcs::GitCli;

/// Loops to run: all of them, or the `--only` selection in launch order.
pub fn select_loops(only: &[String]) -> Result<Vec<LoopKind>> {
    if only.is_empty() {
        return Ok(LoopKind::ALL.to_vec());
    }
    let mut kinds = only
        .iter()
        .map(|name| name.parse::<LoopKind>())
        .collect::<Result<Vec<_>>>()?;
    kinds.sort();
    kinds.dedup();
    Ok(kinds)
}

pub async fn cmd_run(project_dir: &Path, verbose: bool, only: &[String]) -> Result<()> {
    let kinds = select_loops(only)?;
    let (config, paths) = super::load(project_dir)?;
    config.validate().context("Invalid configuration")?;
    paths.ensure_directories()?;
    let _guard = devloop::logging::init(&paths.log_dir, verbose)?;

    let board: Arc<dyn devloop::board::Board> = Arc::new(GhBoard::new(config.board.clone()));
    let vcs = Arc::new(GitCli::new(project_dir));
    let runner = Arc::new(CliAgentRunner::new(
        config.agent.command(),
        config.agent.flags.clone(),
        Duration::from_secs(config.agent.timeout_secs),
    ));
    let notifier = devloop::notify::from_config(Arc::clone(&board), config.notify.webhook_url.as_deref())?;

    tracing::info!(
        repo = %config.board.repo,
        project = config.board.project_number,
        agent = %config.agent.command(),
        "devloop starting"
    );
    let ctx = Arc::new(LoopContext::new(
        config,
        paths,
        board,
        vcs,
        runner,
        notifier,
        StopSignal::new(),
    ));

    match Supervisor::new(ctx, kinds).run().await? {
        ExitReason::Stopped => println!("{} Stopped", console::style("■").red()),
        ExitReason::Shutdown => println!("{} Shut down after draining agents", console::style("✓").green()),
        ExitReason::Interrupted => println!("{} Interrupted", console::style("■").yellow()),
    }
    Ok(())
}
