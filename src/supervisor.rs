//! Loop supervisor.
//!
//! Launches the phase loops with a stagger, then ticks: a STOP marker kills
//! every loop and agent at once, a SHUTDOWN marker stops dispatching and
//! drains live agents (bounded by the drain timeout), and otherwise any loop
//! task that has died is restarted. Each tick also rewrites `loops.json` so
//! `devloop status` can report liveness from another process.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::control::{ControlMarkers, ControlRequest};
use crate::loops::{LoopContext, LoopKind, run_loop};
use crate::util::atomic_write_json;

/// Why the supervisor returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Stopped,
    Shutdown,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    pub name: LoopKind,
    pub alive: bool,
    pub restarts: u32,
}

/// Contents of `loops.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub loops: Vec<LoopState>,
    pub active_agents: usize,
}

impl LivenessRecord {
    pub fn load(path: &std::path::Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }
}

pub struct Supervisor {
    ctx: Arc<LoopContext>,
    kinds: Vec<LoopKind>,
    markers: ControlMarkers,
    tick: Duration,
    stagger: Duration,
    tasks: BTreeMap<LoopKind, JoinHandle<()>>,
    restarts: BTreeMap<LoopKind, u32>,
    started_at: DateTime<Utc>,
}

impl Supervisor {
    pub fn new(ctx: Arc<LoopContext>, kinds: Vec<LoopKind>) -> Self {
        let markers = ControlMarkers::new(ctx.paths.stop_marker.clone(), ctx.paths.shutdown_marker.clone());
        let tick = Duration::from_secs(ctx.config.intervals.supervisor_tick.max(1));
        let stagger = Duration::from_secs(ctx.config.intervals.stagger);
        Self {
            ctx,
            kinds,
            markers,
            tick,
            stagger,
            tasks: BTreeMap::new(),
            restarts: BTreeMap::new(),
            started_at: Utc::now(),
        }
    }

    /// Start every loop, `stagger` apart so they do not hit the board together.
    pub async fn launch(&mut self) {
        let kinds = self.kinds.clone();
        for (i, kind) in kinds.into_iter().enumerate() {
            if i > 0 && !self.stagger.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.stagger) => {}
                    _ = self.ctx.stop.stopped() => return,
                }
            }
            self.spawn(kind);
        }
        self.write_liveness();
    }

    fn spawn(&mut self, kind: LoopKind) {
        let handle = tokio::spawn(run_loop(kind, Arc::clone(&self.ctx)));
        self.tasks.insert(kind, handle);
    }

    /// Restart loops whose task has ended. Returns how many were restarted;
    /// calling it again with every loop alive restarts nothing.
    pub fn ensure_alive(&mut self) -> usize {
        if self.ctx.stop.is_stopped() {
            return 0;
        }
        let dead: Vec<LoopKind> = self
            .kinds
            .iter()
            .copied()
            .filter(|kind| self.tasks.get(kind).is_none_or(|h| h.is_finished()))
            .collect();
        for kind in &dead {
            let restarts = self.restarts.entry(*kind).or_default();
            *restarts += 1;
            tracing::warn!(loop_name = kind.name(), restarts = *restarts, "Loop died, restarting");
            self.spawn(*kind);
        }
        self.write_liveness();
        dead.len()
    }

    pub fn loop_states(&self) -> Vec<LoopState> {
        self.kinds
            .iter()
            .map(|kind| LoopState {
                name: *kind,
                alive: self.tasks.get(kind).is_some_and(|h| !h.is_finished()),
                restarts: self.restarts.get(kind).copied().unwrap_or(0),
            })
            .collect()
    }

    fn write_liveness(&self) {
        let record = LivenessRecord {
            pid: std::process::id(),
            started_at: self.started_at,
            updated_at: Utc::now(),
            loops: self.loop_states(),
            active_agents: self.ctx.pools.total_active(),
        };
        if let Err(e) = atomic_write_json(&self.ctx.paths.liveness, &record) {
            tracing::warn!(error = %format!("{:#}", e), "Failed to write liveness record");
        }
    }

    /// Launch the loops and supervise until a control marker or Ctrl-C.
    pub async fn run(mut self) -> Result<ExitReason> {
        // Markers from an earlier run must not stop this one.
        self.markers.clear_all();
        tracing::info!(
            loops = ?self.kinds.iter().map(|k| k.name()).collect::<Vec<_>>(),
            tick_secs = self.tick.as_secs(),
            "Supervisor starting"
        );
        self.launch().await;

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("Interrupted, stopping immediately");
                    self.stop_now();
                    return Ok(ExitReason::Interrupted);
                }
            }

            match self.markers.check() {
                Some(ControlRequest::Stop) => {
                    tracing::warn!("STOP requested, killing loops and agents");
                    self.stop_now();
                    self.markers.clear(ControlRequest::Stop);
                    return Ok(ExitReason::Stopped);
                }
                Some(ControlRequest::Shutdown) => {
                    tracing::info!("SHUTDOWN requested, draining agents");
                    self.drain().await;
                    self.markers.clear(ControlRequest::Shutdown);
                    return Ok(ExitReason::Shutdown);
                }
                None => {
                    self.ensure_alive();
                }
            }
        }
    }

    fn halt_loops(&mut self) {
        self.ctx.stop.trigger();
        for handle in self.tasks.values() {
            handle.abort();
        }
    }

    fn stop_now(&mut self) {
        self.halt_loops();
        let killed = self.ctx.pools.kill_all();
        tracing::info!(killed, "All loops and agents stopped");
        self.write_liveness();
    }

    async fn drain(&mut self) {
        self.halt_loops();
        let timeout = self.ctx.config.drain_timeout();
        let active = self.ctx.pools.total_active();
        tracing::info!(active, timeout_secs = timeout.as_secs(), "Waiting for live agents");

        if tokio::time::timeout(timeout, self.ctx.pools.idle()).await.is_err() {
            let killed = self.ctx.pools.kill_all();
            tracing::warn!(killed, "Drain timed out, killed remaining agents");
        } else {
            tracing::info!("All agents finished");
        }
        self.write_liveness();
    }

    #[cfg(test)]
    fn abort_loop(&mut self, kind: LoopKind) {
        if let Some(handle) = self.tasks.get(&kind) {
            handle.abort();
        }
    }
}
