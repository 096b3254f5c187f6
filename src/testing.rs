//! In-memory doubles for the external collaborators.
//!
//! `MemoryBoard`, `MockVcs`, `ScriptedAgent` and `RecordingNotifier` stand in
//! for the tracking board, git, the coding agent and human notification so
//! loops and the supervisor can be driven end to end without touching the
//! network or spawning processes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;

use crate::agent::{AgentExit, AgentRequest, AgentRunner, Phase};
use crate::board::{Board, ChangeRequest, Comment, ItemDetail, ItemId, RateLimit, Status, WorkItem};
use crate::errors::{BoardError, DispatchError, WorkspaceError};
use crate::notify::{Escalation, Notifier};
use crate::vcs::{RebaseOutcome, Vcs};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn unavailable(command: &str) -> BoardError {
    BoardError::CommandFailed {
        command: command.to_string(),
        code: Some(1),
        stderr: "simulated failure".to_string(),
    }
}

#[derive(Debug, Clone)]
struct ChangeRequestState {
    change_request: ChangeRequest,
    title: String,
    open: bool,
    merged: bool,
}

#[derive(Default)]
struct BoardState {
    items: BTreeMap<ItemId, WorkItem>,
    details: HashMap<ItemId, ItemDetail>,
    comments: HashMap<ItemId, Vec<String>>,
    change_requests: Vec<ChangeRequestState>,
    approvals: Vec<u64>,
    change_requests_requested: Vec<(u64, String)>,
    status_history: Vec<(ItemId, Status)>,
}

/// A board held in memory.
pub struct MemoryBoard {
    state: Mutex<BoardState>,
    list_delay: Mutex<Duration>,
    list_calls: AtomicUsize,
    fail_next_list: AtomicBool,
    set_status_calls: AtomicUsize,
    set_status_failures: AtomicUsize,
    set_status_delay: Mutex<Duration>,
    remaining: AtomicU64,
    rate_limit_calls: AtomicUsize,
    fail_rate_limit: AtomicBool,
    next_number: AtomicU64,
}

impl Default for MemoryBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBoard {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BoardState::default()),
            list_delay: Mutex::new(Duration::ZERO),
            list_calls: AtomicUsize::new(0),
            fail_next_list: AtomicBool::new(false),
            set_status_calls: AtomicUsize::new(0),
            set_status_failures: AtomicUsize::new(0),
            set_status_delay: Mutex::new(Duration::ZERO),
            remaining: AtomicU64::new(5000),
            rate_limit_calls: AtomicUsize::new(0),
            fail_rate_limit: AtomicBool::new(false),
            next_number: AtomicU64::new(100),
        }
    }

    pub fn insert(&self, item: WorkItem) {
        guard(&self.state).items.insert(item.id, item);
    }

    pub fn set_detail(&self, id: ItemId, detail: ItemDetail) {
        guard(&self.state).details.insert(id, detail);
    }

    /// Change a status behind the orchestrator's back (a human edit).
    pub fn force_status(&self, id: ItemId, status: Status) {
        if let Some(item) = guard(&self.state).items.get_mut(&id) {
            item.status = status;
        }
    }

    pub fn status_of(&self, id: ItemId) -> Option<Status> {
        guard(&self.state).items.get(&id).map(|i| i.status)
    }

    /// Every status written through `set_status`, in order.
    pub fn status_history(&self) -> Vec<(ItemId, Status)> {
        guard(&self.state).status_history.clone()
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *guard(&self.list_delay) = delay;
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_list(&self) {
        self.fail_next_list.store(true, Ordering::SeqCst);
    }

    pub fn set_status_calls(&self) -> usize {
        self.set_status_calls.load(Ordering::SeqCst)
    }

    /// Fail the next `n` status writes with a transient error.
    pub fn fail_set_status(&self, n: usize) {
        self.set_status_failures.store(n, Ordering::SeqCst);
    }

    /// Make every status write take `delay` before it lands.
    pub fn delay_set_status(&self, delay: Duration) {
        *guard(&self.set_status_delay) = delay;
    }

    pub fn set_remaining(&self, remaining: u64) {
        self.remaining.store(remaining, Ordering::SeqCst);
    }

    pub fn rate_limit_calls(&self) -> usize {
        self.rate_limit_calls.load(Ordering::SeqCst)
    }

    pub fn fail_rate_limit(&self, fail: bool) {
        self.fail_rate_limit.store(fail, Ordering::SeqCst);
    }

    /// Open a change request for `branch` as if someone had pushed it.
    pub fn open_change_request(&self, branch: &str, is_draft: bool) -> ChangeRequest {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        let change_request = ChangeRequest {
            number,
            branch: branch.to_string(),
            is_draft,
            url: format!("https://board.test/pull/{}", number),
        };
        guard(&self.state).change_requests.push(ChangeRequestState {
            change_request: change_request.clone(),
            title: String::new(),
            open: true,
            merged: false,
        });
        change_request
    }

    /// Flip the open change request on `branch` out of draft.
    pub fn mark_ready(&self, branch: &str) {
        let mut state = guard(&self.state);
        if let Some(cr) = state
            .change_requests
            .iter_mut()
            .find(|c| c.open && c.change_request.branch == branch)
        {
            cr.change_request.is_draft = false;
        }
    }

    /// The open change request on `branch`.
    pub fn change_request(&self, branch: &str) -> Option<ChangeRequest> {
        guard(&self.state)
            .change_requests
            .iter()
            .find(|c| c.open && c.change_request.branch == branch)
            .map(|c| c.change_request.clone())
    }

    pub fn change_request_title(&self, number: u64) -> Option<String> {
        guard(&self.state)
            .change_requests
            .iter()
            .find(|c| c.change_request.number == number)
            .map(|c| c.title.clone())
    }

    pub fn is_merged(&self, number: u64) -> bool {
        guard(&self.state)
            .change_requests
            .iter()
            .any(|c| c.change_request.number == number && c.merged)
    }

    pub fn is_closed(&self, number: u64) -> bool {
        guard(&self.state)
            .change_requests
            .iter()
            .any(|c| c.change_request.number == number && !c.open)
    }

    pub fn approvals(&self) -> Vec<u64> {
        guard(&self.state).approvals.clone()
    }

    pub fn requested_changes(&self) -> Vec<(u64, String)> {
        guard(&self.state).change_requests_requested.clone()
    }

    pub fn comments(&self, id: ItemId) -> Vec<String> {
        guard(&self.state).comments.get(&id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Board for MemoryBoard {
    async fn list_items(&self) -> Result<Vec<WorkItem>, BoardError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *guard(&self.list_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next_list.swap(false, Ordering::SeqCst) {
            return Err(unavailable("list items"));
        }
        Ok(guard(&self.state).items.values().cloned().collect())
    }

    async fn item_detail(&self, id: ItemId) -> Result<ItemDetail, BoardError> {
        let state = guard(&self.state);
        if let Some(detail) = state.details.get(&id) {
            return Ok(detail.clone());
        }
        let item = state.items.get(&id).ok_or(BoardError::UnknownItem { id })?;
        Ok(ItemDetail {
            title: item.title.clone(),
            body: String::new(),
            labels: item.labels.clone(),
            comments: Vec::<Comment>::new(),
        })
    }

    async fn set_status(&self, item: &WorkItem, status: Status) -> Result<(), BoardError> {
        self.set_status_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *guard(&self.set_status_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let pending = self.set_status_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.set_status_failures.store(pending - 1, Ordering::SeqCst);
            return Err(unavailable("set status"));
        }
        let mut state = guard(&self.state);
        let entry = state
            .items
            .get_mut(&item.id)
            .ok_or(BoardError::UnknownItem { id: item.id })?;
        entry.status = status;
        state.status_history.push((item.id, status));
        Ok(())
    }

    async fn add_comment(&self, id: ItemId, body: &str) -> Result<(), BoardError> {
        guard(&self.state)
            .comments
            .entry(id)
            .or_default()
            .push(body.to_string());
        Ok(())
    }

    async fn change_request_for_branch(&self, branch: &str) -> Result<Option<ChangeRequest>, BoardError> {
        Ok(self.change_request(branch))
    }

    async fn create_draft_change_request(
        &self,
        branch: &str,
        _base: &str,
        title: &str,
        _body: &str,
    ) -> Result<ChangeRequest, BoardError> {
        let cr = self.open_change_request(branch, true);
        if let Some(state) = guard(&self.state)
            .change_requests
            .iter_mut()
            .find(|c| c.change_request.number == cr.number)
        {
            state.title = title.to_string();
        }
        Ok(cr)
    }

    async fn approve_change_request(&self, number: u64, _body: &str) -> Result<(), BoardError> {
        guard(&self.state).approvals.push(number);
        Ok(())
    }

    async fn request_changes(&self, number: u64, body: &str) -> Result<(), BoardError> {
        guard(&self.state)
            .change_requests_requested
            .push((number, body.to_string()));
        Ok(())
    }

    async fn merge_change_request(&self, number: u64) -> Result<(), BoardError> {
        let mut state = guard(&self.state);
        let cr = state
            .change_requests
            .iter_mut()
            .find(|c| c.change_request.number == number && c.open)
            .ok_or_else(|| unavailable("merge"))?;
        cr.open = false;
        cr.merged = true;
        Ok(())
    }

    async fn close_change_request(&self, number: u64, _comment: &str) -> Result<(), BoardError> {
        if let Some(cr) = guard(&self.state)
            .change_requests
            .iter_mut()
            .find(|c| c.change_request.number == number)
        {
            cr.open = false;
        }
        Ok(())
    }

    async fn rate_limit(&self) -> Result<RateLimit, BoardError> {
        self.rate_limit_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_rate_limit.load(Ordering::SeqCst) {
            return Err(unavailable("rate limit"));
        }
        Ok(RateLimit {
            remaining: self.remaining.load(Ordering::SeqCst),
            limit: 5000,
            reset_at: None,
        })
    }

    fn item_url(&self, id: ItemId) -> String {
        format!("https://board.test/issues/{}", id)
    }
}

/// A recorded version-control call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsCall {
    Fetch,
    AddWorktree { branch: String, start: String },
    Rebase { onto: String },
    CommitMarker,
    Push { branch: String, force: bool },
    RemoveWorktree { path: PathBuf },
    DeleteBranch { branch: String },
}

#[derive(Default)]
struct VcsState {
    calls: Vec<VcsCall>,
    remote_branches: HashSet<String>,
    conflict: bool,
    fail_push: bool,
    fail_remove: bool,
}

/// Records calls instead of running git.
#[derive(Default)]
pub struct MockVcs {
    state: Mutex<VcsState>,
}

impl MockVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<VcsCall> {
        guard(&self.state).calls.clone()
    }

    pub fn add_remote_branch(&self, branch: &str) {
        guard(&self.state).remote_branches.insert(branch.to_string());
    }

    pub fn conflict_on_rebase(&self, conflict: bool) {
        guard(&self.state).conflict = conflict;
    }

    pub fn fail_push(&self, fail: bool) {
        guard(&self.state).fail_push = fail;
    }

    pub fn fail_remove(&self, fail: bool) {
        guard(&self.state).fail_remove = fail;
    }

    fn record(&self, call: VcsCall) {
        guard(&self.state).calls.push(call);
    }
}

#[async_trait]
impl Vcs for MockVcs {
    async fn fetch(&self, _remote: &str) -> Result<(), WorkspaceError> {
        self.record(VcsCall::Fetch);
        Ok(())
    }

    async fn remote_branch_exists(&self, _remote: &str, branch: &str) -> Result<bool, WorkspaceError> {
        Ok(guard(&self.state).remote_branches.contains(branch))
    }

    async fn add_worktree(&self, path: &Path, branch: &str, start: &str) -> Result<(), WorkspaceError> {
        std::fs::create_dir_all(path).map_err(|e| WorkspaceError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.record(VcsCall::AddWorktree {
            branch: branch.to_string(),
            start: start.to_string(),
        });
        Ok(())
    }

    async fn rebase(&self, _workdir: &Path, onto: &str) -> Result<RebaseOutcome, WorkspaceError> {
        self.record(VcsCall::Rebase { onto: onto.to_string() });
        if guard(&self.state).conflict {
            Ok(RebaseOutcome::Conflict)
        } else {
            Ok(RebaseOutcome::Clean)
        }
    }

    async fn commit_marker(&self, _workdir: &Path, _message: &str) -> Result<(), WorkspaceError> {
        self.record(VcsCall::CommitMarker);
        Ok(())
    }

    async fn push(&self, _workdir: &Path, _remote: &str, branch: &str, force: bool) -> Result<(), WorkspaceError> {
        let mut state = guard(&self.state);
        if state.fail_push {
            return Err(WorkspaceError::Git {
                command: format!("push {}", branch),
                stderr: "simulated failure".to_string(),
            });
        }
        state.calls.push(VcsCall::Push {
            branch: branch.to_string(),
            force,
        });
        state.remote_branches.insert(branch.to_string());
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path) -> Result<(), WorkspaceError> {
        self.record(VcsCall::RemoveWorktree { path: path.to_path_buf() });
        if guard(&self.state).fail_remove {
            return Err(WorkspaceError::Git {
                command: "worktree remove".to_string(),
                stderr: "simulated failure".to_string(),
            });
        }
        let _ = std::fs::remove_dir_all(path);
        Ok(())
    }

    async fn delete_local_branch(&self, branch: &str) -> Result<(), WorkspaceError> {
        self.record(VcsCall::DeleteBranch {
            branch: branch.to_string(),
        });
        Ok(())
    }
}

/// An agent that replies with canned transcripts.
pub struct ScriptedAgent {
    transcripts: Mutex<HashMap<(Option<Phase>, ItemId), String>>,
    failures: Mutex<HashSet<ItemId>>,
    requests: Mutex<Vec<AgentRequest>>,
    gate: Option<watch::Sender<bool>>,
    max_delay: Option<Duration>,
}

impl Default for ScriptedAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self {
            transcripts: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
            gate: None,
            max_delay: None,
        }
    }

    /// Hold every invocation until `open_gate` is called.
    pub fn with_gate(mut self) -> Self {
        let (tx, _rx) = watch::channel(false);
        self.gate = Some(tx);
        self
    }

    /// Sleep a random duration up to `max` per invocation.
    pub fn with_random_delay(mut self, max: Duration) -> Self {
        self.max_delay = Some(max);
        self
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.send_replace(true);
        }
    }

    /// Transcript for `item` in any phase.
    pub fn script(&self, item: ItemId, transcript: &str) {
        guard(&self.transcripts).insert((None, item), transcript.to_string());
    }

    /// Transcript for `item` in one phase, taking precedence over `script`.
    pub fn script_phase(&self, phase: Phase, item: ItemId, transcript: &str) {
        guard(&self.transcripts).insert((Some(phase), item), transcript.to_string());
    }

    /// Make invocations for `item` fail to spawn.
    pub fn fail(&self, item: ItemId) {
        guard(&self.failures).insert(item);
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        guard(&self.requests).clone()
    }
}

#[async_trait]
impl AgentRunner for ScriptedAgent {
    async fn run(&self, request: &AgentRequest) -> Result<AgentExit, DispatchError> {
        guard(&self.requests).push(request.clone());

        if let Some(gate) = &self.gate {
            let mut rx = gate.subscribe();
            let _ = rx.wait_for(|open| *open).await;
        }
        if let Some(max) = self.max_delay {
            let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
        if guard(&self.failures).contains(&request.item) {
            return Err(DispatchError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "scripted spawn failure",
            )));
        }

        let transcripts = guard(&self.transcripts);
        let transcript = transcripts
            .get(&(Some(request.phase), request.item))
            .or_else(|| transcripts.get(&(None, request.item)))
            .cloned()
            .unwrap_or_default();
        Ok(AgentExit {
            success: true,
            code: Some(0),
            transcript,
        })
    }
}

/// Collects escalations.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Escalation>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn escalations(&self) -> Vec<Escalation> {
        guard(&self.sent).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, escalation: &Escalation) -> Result<()> {
        if self.fail {
            anyhow::bail!("notification sink unavailable");
        }
        guard(&self.sent).push(escalation.clone());
        Ok(())
    }
}

/// Shared handle bundle for driving loops in tests.
pub struct Harness {
    pub board: Arc<MemoryBoard>,
    pub vcs: Arc<MockVcs>,
    pub agent: Arc<ScriptedAgent>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_agent(ScriptedAgent::new())
    }

    pub fn with_agent(agent: ScriptedAgent) -> Self {
        Self {
            board: Arc::new(MemoryBoard::new()),
            vcs: Arc::new(MockVcs::new()),
            agent: Arc::new(agent),
            notifier: Arc::new(RecordingNotifier::new()),
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
