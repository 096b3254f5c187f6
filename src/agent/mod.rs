//! Coding-agent invocation.
//!
//! | Module    | Responsibility                                               |
//! |-----------|--------------------------------------------------------------|
//! | `runner`  | `AgentRunner` trait and the CLI-backed `CliAgentRunner`      |
//! | `pool`    | Bounded per-phase `AgentPool`                                |
//! | `outcome` | `Phase`, result markers and transcript parsing               |
//! | `prompts` | Per-phase instructions                                       |

pub mod outcome;
pub mod pool;
pub mod prompts;
pub mod runner;

use std::path::{Path, PathBuf};

pub use outcome::{AgentOutcome, Marker, Phase, parse_outcome};
pub use pool::{AgentPool, AgentPools, InvocationInfo};
pub use runner::{AgentExit, AgentRequest, AgentRunner, CliAgentRunner};

use crate::board::ItemId;

/// `<dir>/<phase>-<item>-<timestamp>.log`
pub fn log_path(dir: &Path, phase: Phase, item: ItemId) -> PathBuf {
    dir.join(format!(
        "{}-{}-{}.log",
        phase,
        item,
        chrono::Utc::now().format("%Y%m%dT%H%M%S%3f")
    ))
}
