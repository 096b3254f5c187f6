//! Bounce and hold ledgers: `devloop bounces` and `devloop holds`.

use std::path::Path;

use anyhow::Result;
use devloop::bounce::BounceTracker;
use devloop::holds::HoldLedger;
use devloop::records::AppendLog;

use super::super::{BounceCommands, HoldCommands};

pub fn cmd_bounces(project_dir: &Path, command: Option<BounceCommands>) -> Result<()> {
    let (config, paths) = super::load(project_dir)?;
    let tracker = BounceTracker::new(AppendLog::new(paths.bounce_log), config.policy.max_bounces);

    match command {
        None | Some(BounceCommands::Show) => {
            let mut counts: Vec<_> = tracker.counts()?.into_iter().filter(|(_, n)| *n > 0).collect();
            if counts.is_empty() {
                println!("No bounces recorded.");
                return Ok(());
            }
            counts.sort();
            println!("{:<8} {:>7}", "ITEM", "BOUNCES");
            for (item, count) in counts {
                let flag = if tracker.should_escalate(count) { "  (escalated)" } else { "" };
                println!("#{:<7} {:>7}{}", item, count, flag);
            }
        }
        Some(BounceCommands::Reset { item }) => {
            tracker.reset(item)?;
            println!("Bounce count for #{} reset.", item);
        }
    }
    Ok(())
}

pub fn cmd_holds(project_dir: &Path, command: Option<HoldCommands>) -> Result<()> {
    let (_, paths) = super::load(project_dir)?;
    let ledger = HoldLedger::new(AppendLog::new(paths.hold_log));

    match command {
        None | Some(HoldCommands::Show) => {
            let held = ledger.held()?;
            if held.is_empty() {
                println!("No items held.");
                return Ok(());
            }
            println!("{:<8} PHASE", "ITEM");
            for (item, phase) in held {
                println!("#{:<7} {}", item, phase);
            }
        }
        Some(HoldCommands::Release { item }) => {
            if !ledger.is_held(item)? {
                println!("#{} is not held.", item);
                return Ok(());
            }
            ledger.release(item)?;
            println!("Released #{}; it will be picked up on the next cycle.", item);
        }
    }
    Ok(())
}
