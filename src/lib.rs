//! devloop: an autonomous board orchestrator.
//!
//! Work items on a tracking board are driven through triage, planning,
//! implementation and review by pooled coding-agent invocations. Each phase
//! is an independent polling loop; the board's status column is the only
//! shared state between them.

pub mod agent;
pub mod board;
pub mod bounce;
pub mod cache;
pub mod config;
pub mod control;
pub mod errors;
pub mod governor;
pub mod holds;
pub mod logging;
pub mod loops;
pub mod notify;
pub mod records;
pub mod retry;
pub mod supervisor;
pub mod testing;
pub mod util;
pub mod vcs;
pub mod workspace;
