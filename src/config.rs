//! Configuration for devloop.
//!
//! Settings are read from `.devloop/devloop.toml`, then overridden by the
//! environment, then by CLI flags. Every section has defaults so an empty
//! (or missing) file yields a runnable configuration once `board.repo` is set.
//!
//! # Configuration File Format
//!
//! ```toml
//! [board]
//! repo = "acme/widgets"
//! owner = "acme"
//! project_number = 4
//! project_id = "PVT_xxx"
//! status_field_id = "PVTSSF_xxx"
//!
//! [agent]
//! command = "claude"
//! timeout_secs = 3600
//!
//! [pools]
//! triage = 2
//! planning = 2
//! implement = 3
//! review = 2
//! audit = 1
//!
//! [intervals]
//! sync = 120
//! implement = 60
//! audit = 300
//!
//! [rate_limit]
//! threshold = 1000
//!
//! [policy]
//! max_bounces = 2
//! audit_backlog_floor = 5
//!
//! [workspace]
//! trunk = "main"
//!
//! [notify]
//! webhook_url = "https://hooks.example.com/devloop"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::retry::RetryConfig;

/// Tracking-board coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardSection {
    /// `owner/name` of the repository the board tracks.
    #[serde(default)]
    pub repo: String,
    /// Owner of the project board.
    #[serde(default)]
    pub owner: String,
    #[serde(default = "default_project_number")]
    pub project_number: u64,
    /// Project node id used by status mutations.
    #[serde(default)]
    pub project_id: String,
    /// Status single-select field id.
    #[serde(default)]
    pub status_field_id: String,
    /// Status display name → single-select option id.
    #[serde(default = "default_status_options")]
    pub status_options: BTreeMap<String, String>,
    /// Timeout for a single `gh` invocation.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_project_number() -> u64 {
    1
}

fn default_command_timeout() -> u64 {
    60
}

fn default_status_options() -> BTreeMap<String, String> {
    [
        ("Triage", "7075b0bd"),
        ("Planning", "5860e624"),
        ("Todo", "398c03ac"),
        ("In Progress", "20fd4c4d"),
        ("AI Review", "35df9b65"),
        ("Rejected", "1b81d027"),
        ("In Review", "bbfc519d"),
        ("Done", "873d8d61"),
        ("Need Human", "f96e10cc"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for BoardSection {
    fn default() -> Self {
        Self {
            repo: String::new(),
            owner: String::new(),
            project_number: default_project_number(),
            project_id: String::new(),
            status_field_id: String::new(),
            status_options: default_status_options(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

/// Coding-agent CLI settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent command (default: "claude", or `CLAUDE_CMD`)
    #[serde(default)]
    pub command: Option<String>,
    /// Flags passed before the prompt.
    #[serde(default = "default_agent_flags")]
    pub flags: Vec<String>,
    /// Hard limit on a single invocation.
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

fn default_agent_flags() -> Vec<String> {
    vec!["--print".to_string(), "--dangerously-skip-permissions".to_string()]
}

fn default_agent_timeout() -> u64 {
    3600
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            flags: default_agent_flags(),
            timeout_secs: default_agent_timeout(),
        }
    }
}

impl AgentSection {
    pub fn command(&self) -> String {
        self.command
            .clone()
            .or_else(|| std::env::var("CLAUDE_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }
}

/// Per-phase agent pool capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolsSection {
    #[serde(default = "default_two")]
    pub triage: usize,
    #[serde(default = "default_two")]
    pub planning: usize,
    #[serde(default = "default_three")]
    pub implement: usize,
    #[serde(default = "default_two")]
    pub review: usize,
    #[serde(default = "default_one")]
    pub audit: usize,
}

fn default_one() -> usize {
    1
}

fn default_two() -> usize {
    2
}

fn default_three() -> usize {
    3
}

impl Default for PoolsSection {
    fn default() -> Self {
        Self {
            triage: 2,
            planning: 2,
            implement: 3,
            review: 2,
            audit: 1,
        }
    }
}

/// Loop and supervisor intervals, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalsSection {
    #[serde(default = "default_sync_interval")]
    pub sync: u64,
    #[serde(default = "default_sixty")]
    pub triage: u64,
    #[serde(default = "default_sixty")]
    pub planning: u64,
    #[serde(default = "default_sixty")]
    pub implement: u64,
    #[serde(default = "default_promote_interval")]
    pub promote: u64,
    #[serde(default = "default_sixty")]
    pub review: u64,
    #[serde(default = "default_audit_interval")]
    pub audit: u64,
    #[serde(default = "default_sixty")]
    pub status: u64,
    /// Supervisor liveness/marker check period.
    #[serde(default = "default_tick")]
    pub supervisor_tick: u64,
    /// Delay between successive loop launches.
    #[serde(default = "default_stagger")]
    pub stagger: u64,
}

fn default_sync_interval() -> u64 {
    120
}

fn default_sixty() -> u64 {
    60
}

fn default_promote_interval() -> u64 {
    90
}

fn default_audit_interval() -> u64 {
    300
}

fn default_tick() -> u64 {
    10
}

fn default_stagger() -> u64 {
    5
}

impl Default for IntervalsSection {
    fn default() -> Self {
        Self {
            sync: default_sync_interval(),
            triage: 60,
            planning: 60,
            implement: 60,
            promote: default_promote_interval(),
            review: 60,
            audit: default_audit_interval(),
            status: 60,
            supervisor_tick: default_tick(),
            stagger: default_stagger(),
        }
    }
}

/// Rate governor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    /// Dispatch blocks while remaining quota is below this.
    #[serde(default = "default_threshold")]
    pub threshold: u64,
    /// How long a quota snapshot is reused.
    #[serde(default = "default_rate_ttl")]
    pub snapshot_ttl_secs: u64,
    /// Re-check period while limited.
    #[serde(default = "default_sixty")]
    pub wait_secs: u64,
}

fn default_threshold() -> u64 {
    1000
}

fn default_rate_ttl() -> u64 {
    30
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            snapshot_ttl_secs: default_rate_ttl(),
            wait_secs: 60,
        }
    }
}

/// Status cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_sixty")]
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self { ttl_secs: 60 }
    }
}

/// Escalation and throttling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySection {
    /// Review rejections before an item is handed to a human.
    #[serde(default = "default_max_bounces")]
    pub max_bounces: u32,
    /// Audit runs only while Triage+Todo+Planning is at or below this.
    #[serde(default = "default_backlog_floor")]
    pub audit_backlog_floor: usize,
    /// Graceful shutdown waits this long for invocations before killing them.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

fn default_max_bounces() -> u32 {
    2
}

fn default_backlog_floor() -> usize {
    5
}

fn default_drain_timeout() -> u64 {
    900
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            max_bounces: default_max_bounces(),
            audit_backlog_floor: default_backlog_floor(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

/// Working-copy layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSection {
    /// Directory (relative to the project) holding per-item worktrees.
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
    #[serde(default = "default_trunk")]
    pub trunk: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".worktrees")
}

fn default_trunk() -> String {
    "main".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch_prefix() -> String {
    "fix/issue-".to_string()
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            trunk: default_trunk(),
            remote: default_remote(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

/// Human notification settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifySection {
    /// Escalations are POSTed here as JSON when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// The complete devloop.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevloopConfig {
    #[serde(default)]
    pub board: BoardSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub pools: PoolsSection,
    #[serde(default)]
    pub intervals: IntervalsSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub notify: NotifySection,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl DevloopConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse devloop.toml")
    }

    /// Load `devloop.toml` from the state directory, or defaults if absent.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join("devloop.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize devloop.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        if let Ok(cmd) = std::env::var("DEVLOOP_AGENT_CMD") {
            self.agent.command = Some(cmd);
        }
        if let Ok(repo) = std::env::var("DEVLOOP_REPO") {
            self.board.repo = repo;
        }
        if let Ok(url) = std::env::var("DEVLOOP_WEBHOOK_URL") {
            self.notify.webhook_url = Some(url);
        }
        if self.board.owner.is_empty()
            && let Some((owner, _)) = self.board.repo.split_once('/')
        {
            self.board.owner = owner.to_string();
        }
    }

    /// Reject values that would stall or break the scheduler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pools = [
            ("triage", self.pools.triage),
            ("planning", self.pools.planning),
            ("implement", self.pools.implement),
            ("review", self.pools.review),
            ("audit", self.pools.audit),
        ];
        for (phase, capacity) in pools {
            if capacity == 0 {
                return Err(ConfigError::ZeroCapacity { phase: phase.to_string() });
            }
        }

        let i = &self.intervals;
        let intervals = [
            ("sync", i.sync),
            ("triage", i.triage),
            ("planning", i.planning),
            ("implement", i.implement),
            ("promote", i.promote),
            ("review", i.review),
            ("audit", i.audit),
            ("status", i.status),
            ("supervisor_tick", i.supervisor_tick),
            ("rate_limit.wait_secs", self.rate_limit.wait_secs),
            ("cache.ttl_secs", self.cache.ttl_secs),
        ];
        for (name, secs) in intervals {
            if secs == 0 {
                return Err(ConfigError::ZeroInterval { name: name.to_string() });
            }
        }

        if self.policy.max_bounces == 0 {
            return Err(ConfigError::ZeroMaxBounces);
        }
        if self.board.repo.is_empty() {
            return Err(ConfigError::MissingRepo);
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.policy.drain_timeout_secs)
    }
}

/// Filesystem layout under the project directory.
#[derive(Debug, Clone)]
pub struct Paths {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub config_file: PathBuf,
    pub log_dir: PathBuf,
    pub agent_log_dir: PathBuf,
    pub records_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub stop_marker: PathBuf,
    pub shutdown_marker: PathBuf,
    pub bounce_log: PathBuf,
    pub hold_log: PathBuf,
    pub rate_snapshot: PathBuf,
    pub liveness: PathBuf,
}

impl Paths {
    pub fn new(project_dir: &Path, workspace: &WorkspaceSection) -> Self {
        let state_dir = project_dir.join(".devloop");
        let log_dir = state_dir.join("logs");
        let records_dir = state_dir.join("state");
        Self {
            project_dir: project_dir.to_path_buf(),
            config_file: state_dir.join("devloop.toml"),
            agent_log_dir: log_dir.join("agents"),
            workspace_root: project_dir.join(&workspace.root),
            stop_marker: state_dir.join("STOP"),
            shutdown_marker: state_dir.join("SHUTDOWN"),
            bounce_log: records_dir.join("bounces.log"),
            hold_log: records_dir.join("holds.log"),
            rate_snapshot: records_dir.join("rate-limit.json"),
            liveness: records_dir.join("loops.json"),
            log_dir,
            records_dir,
            state_dir,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.agent_log_dir).context("Failed to create agent log directory")?;
        std::fs::create_dir_all(&self.records_dir).context("Failed to create records directory")?;
        std::fs::create_dir_all(&self.workspace_root).context("Failed to create workspace root")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = DevloopConfig::parse("").unwrap();
        assert_eq!(config.pools.triage, 2);
        assert_eq!(config.pools.implement, 3);
        assert_eq!(config.pools.audit, 1);
        assert_eq!(config.intervals.sync, 120);
        assert_eq!(config.intervals.promote, 90);
        assert_eq!(config.intervals.audit, 300);
        assert_eq!(config.rate_limit.threshold, 1000);
        assert_eq!(config.rate_limit.snapshot_ttl_secs, 30);
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.policy.max_bounces, 2);
        assert_eq!(config.policy.audit_backlog_floor, 5);
        assert_eq!(config.policy.drain_timeout_secs, 900);
        assert_eq!(config.workspace.branch_prefix, "fix/issue-");
        assert_eq!(config.board.status_options.len(), 9);
    }

    #[test]
    fn test_parse_partial_sections() {
        let config = DevloopConfig::parse(
            r#"
[board]
repo = "acme/widgets"

[pools]
review = 4

[policy]
max_bounces = 3
"#,
        )
        .unwrap();
        assert_eq!(config.board.repo, "acme/widgets");
        assert_eq!(config.pools.review, 4);
        assert_eq!(config.pools.triage, 2);
        assert_eq!(config.policy.max_bounces, 3);
        assert_eq!(config.policy.audit_backlog_floor, 5);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = DevloopConfig::default();
        config.board.repo = "acme/widgets".into();
        config.pools.review = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroCapacity { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_interval_and_bounces() {
        let mut config = DevloopConfig::default();
        config.board.repo = "acme/widgets".into();
        config.intervals.status = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroInterval { .. })));

        let mut config = DevloopConfig::default();
        config.board.repo = "acme/widgets".into();
        config.policy.max_bounces = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroMaxBounces)));
    }

    #[test]
    fn test_validate_requires_repo() {
        assert!(matches!(DevloopConfig::default().validate(), Err(ConfigError::MissingRepo)));
    }

    #[test]
    fn test_owner_derived_from_repo() {
        let mut config = DevloopConfig::default();
        config.board.repo = "acme/widgets".into();
        config.apply_env();
        assert_eq!(config.board.owner, "acme");
    }

    #[test]
    fn test_load_and_save_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devloop.toml");
        let mut config = DevloopConfig::default();
        config.board.repo = "acme/widgets".into();
        config.pools.implement = 5;
        config.save(&path).unwrap();

        let loaded = DevloopConfig::load(&path).unwrap();
        assert_eq!(loaded.board.repo, "acme/widgets");
        assert_eq!(loaded.pools.implement, 5);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = DevloopConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.policy.max_bounces, 2);
    }

    #[test]
    fn test_paths_layout() {
        let paths = Paths::new(Path::new("/repo"), &WorkspaceSection::default());
        assert_eq!(paths.state_dir, PathBuf::from("/repo/.devloop"));
        assert_eq!(paths.stop_marker, PathBuf::from("/repo/.devloop/STOP"));
        assert_eq!(paths.workspace_root, PathBuf::from("/repo/.worktrees"));
        assert_eq!(paths.bounce_log, PathBuf::from("/repo/.devloop/state/bounces.log"));
    }
}
