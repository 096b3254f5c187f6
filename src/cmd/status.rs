//! Local scheduler status: `devloop status`.
//!
//! Reads only files under `.devloop/`, so it works whether or not a
//! scheduler is running and never touches the board.

use std::path::Path;

use anyhow::Result;
use console::style;
use devloop::governor::read_record;
use devloop::holds::HoldLedger;
use devloop::records::AppendLog;
use devloop::supervisor::LivenessRecord;

pub fn cmd_status(project_dir: &Path, json: bool) -> Result<()> {
    let (config, paths) = super::load(project_dir)?;
    let liveness = LivenessRecord::load(&paths.liveness);

    if json {
        println!("{}", serde_json::to_string_pretty(&liveness)?);
        return Ok(());
    }

    println!();
    println!("{}", style("devloop status").bold());
    println!("==============");
    println!();

    match &liveness {
        Some(record) => {
            let age = chrono::Utc::now() - record.updated_at;
            println!(
                "Scheduler pid {} (updated {}s ago), {} live agent(s)",
                record.pid,
                age.num_seconds(),
                record.active_agents
            );
            if age.num_seconds() > 3 * config.intervals.supervisor_tick as i64 {
                println!("  {}", style("record is stale; the scheduler may not be running").yellow());
            }
            for state in &record.loops {
                let marker = if state.alive { style("●").green() } else { style("●").red() };
                println!("  {} {:<10} restarts: {}", marker, state.name.to_string(), state.restarts);
            }
        }
        None => println!("No scheduler has run here yet."),
    }
    println!();

    match read_record(&paths.rate_snapshot) {
        Some(rate) => {
            let limited = rate.remaining < config.rate_limit.threshold;
            println!(
                "Rate limit: {}/{} remaining (threshold {}){}",
                rate.remaining,
                rate.limit,
                config.rate_limit.threshold,
                if limited { style(" LIMITED").red().to_string() } else { String::new() }
            );
        }
        None => println!("Rate limit: no reading yet"),
    }

    let held = HoldLedger::new(AppendLog::new(paths.hold_log.clone())).held()?;
    println!("Held items: {}", held.len());

    if paths.stop_marker.exists() {
        println!("{}", style("STOP pending").red());
    } else if paths.shutdown_marker.exists() {
        println!("{}", style("SHUTDOWN pending").yellow());
    }
    println!();
    Ok(())
}
