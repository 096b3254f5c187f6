use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::runner::{AgentExit, AgentRequest, AgentRunner};
use super::Phase;
use crate::board::ItemId;
use crate::errors::DispatchError;

struct Invocation {
    id: Uuid,
    log_path: PathBuf,
    started_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Read-only view of a live invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationInfo {
    pub item: ItemId,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

type ActiveMap = Arc<Mutex<HashMap<ItemId, Invocation>>>;

/// Bounded dispatcher of agent invocations for one phase.
///
/// Admission (capacity check plus insert) happens under one lock, so
/// `active_count() <= capacity` holds however dispatches and completions
/// interleave. An invocation occupies its slot until its completion handler
/// has applied the outcome.
pub struct AgentPool {
    phase: Phase,
    capacity: usize,
    runner: Arc<dyn AgentRunner>,
    active: ActiveMap,
    finished: Arc<Notify>,
}

fn lock(active: &Mutex<HashMap<ItemId, Invocation>>) -> MutexGuard<'_, HashMap<ItemId, Invocation>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AgentPool {
    pub fn new(phase: Phase, capacity: usize, runner: Arc<dyn AgentRunner>) -> Self {
        Self {
            phase,
            capacity,
            runner,
            active: Arc::new(Mutex::new(HashMap::new())),
            finished: Arc::new(Notify::new()),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.active_count())
    }

    pub fn is_active(&self, item: ItemId) -> bool {
        lock(&self.active).contains_key(&item)
    }

    pub fn active(&self) -> Vec<InvocationInfo> {
        let mut infos: Vec<_> = lock(&self.active)
            .iter()
            .map(|(item, inv)| InvocationInfo {
                item: *item,
                log_path: inv.log_path.clone(),
                started_at: inv.started_at,
            })
            .collect();
        infos.sort_by_key(|i| i.item);
        infos
    }

    /// Start an invocation without waiting for it. `on_exit` receives the
    /// runner's result and runs before the slot is released.
    pub fn dispatch<F, Fut>(&self, request: AgentRequest, on_exit: F) -> Result<Uuid, DispatchError>
    where
        F: FnOnce(Result<AgentExit, DispatchError>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut active = lock(&self.active);
        if active.contains_key(&request.item) {
            return Err(DispatchError::AlreadyActive {
                phase: self.phase.to_string(),
                item: request.item,
            });
        }
        if active.len() >= self.capacity {
            return Err(DispatchError::PoolFull {
                phase: self.phase.to_string(),
                capacity: self.capacity,
            });
        }

        let id = Uuid::new_v4();
        let item = request.item;
        let log_path = request.log_path.clone();
        let runner = Arc::clone(&self.runner);
        let slots = Arc::clone(&self.active);
        let finished = Arc::clone(&self.finished);
        let phase = self.phase;

        let handle = tokio::spawn(async move {
            let result = runner.run(&request).await;
            match &result {
                Ok(exit) => tracing::info!(phase = %phase, item, code = ?exit.code, success = exit.success, "Agent exited"),
                Err(e) => tracing::warn!(phase = %phase, item, error = %e, "Agent failed"),
            }
            on_exit(result).await;

            let mut active = lock(&slots);
            if active.get(&item).is_some_and(|inv| inv.id == id) {
                active.remove(&item);
            }
            drop(active);
            finished.notify_waiters();
        });

        active.insert(
            item,
            Invocation {
                id,
                log_path: log_path.clone(),
                started_at: Utc::now(),
                handle,
            },
        );
        tracing::info!(
            phase = %self.phase,
            item,
            active = active.len(),
            capacity = self.capacity,
            log = %log_path.display(),
            "Agent dispatched"
        );
        Ok(id)
    }

    /// Drop entries whose task has ended without releasing its slot
    /// (a panicking completion handler). Returns how many were pruned.
    pub fn reap_exited(&self) -> usize {
        let mut active = lock(&self.active);
        let before = active.len();
        active.retain(|item, inv| {
            let done = inv.handle.is_finished();
            if done {
                tracing::warn!(phase = %self.phase, item, "Reaped exited invocation");
            }
            !done
        });
        let reaped = before - active.len();
        drop(active);
        if reaped > 0 {
            self.finished.notify_waiters();
        }
        reaped
    }

    /// Abort every live invocation; the agent processes die with their tasks.
    pub fn kill_all(&self) -> usize {
        let drained: Vec<(ItemId, Invocation)> = lock(&self.active).drain().collect();
        for (item, inv) in &drained {
            inv.handle.abort();
            tracing::warn!(phase = %self.phase, item, "Killed agent invocation");
        }
        self.finished.notify_waiters();
        drained.len()
    }

    /// Resolves once no invocation is live.
    pub async fn idle(&self) {
        loop {
            let notified = self.finished.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// One pool per agent-backed phase.
pub struct AgentPools {
    pools: HashMap<Phase, Arc<AgentPool>>,
}

impl AgentPools {
    pub fn new(config: &crate::config::PoolsSection, runner: Arc<dyn AgentRunner>) -> Self {
        let pools = Phase::ALL
            .into_iter()
            .map(|phase| {
                let capacity = match phase {
                    Phase::Triage => config.triage,
                    Phase::Planning => config.planning,
                    Phase::Implement => config.implement,
                    Phase::Review => config.review,
                    Phase::Audit => config.audit,
                };
                (phase, Arc::new(AgentPool::new(phase, capacity, Arc::clone(&runner))))
            })
            .collect();
        Self { pools }
    }

    pub fn get(&self, phase: Phase) -> Arc<AgentPool> {
        // Every phase is populated in `new`.
        Arc::clone(&self.pools[&phase])
    }

    /// (phase, active, capacity) in phase order.
    pub fn usage(&self) -> Vec<(Phase, usize, usize)> {
        Phase::ALL
            .into_iter()
            .map(|phase| {
                let pool = &self.pools[&phase];
                (phase, pool.active_count(), pool.capacity())
            })
            .collect()
    }

    pub fn total_active(&self) -> usize {
        self.pools.values().map(|p| p.active_count()).sum()
    }

    pub fn reap_all(&self) -> usize {
        self.pools.values().map(|p| p.reap_exited()).sum()
    }

    pub fn kill_all(&self) -> usize {
        self.pools.values().map(|p| p.kill_all()).sum()
    }

    /// Resolves once every pool is idle.
    pub async fn idle(&self) {
        for phase in Phase::ALL {
            self.pools[&phase].idle().await;
        }
    }
}
