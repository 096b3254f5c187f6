//! Board data model: statuses, work items, change requests and quota.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Issue number on the tracking board.
pub type ItemId = u64;

/// Lifecycle status of a work item. Exactly one per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Status {
    Triage,
    Planning,
    Todo,
    InProgress,
    AiReview,
    Rejected,
    InReview,
    Done,
    NeedHuman,
    NoStatus,
}

impl Status {
    /// Canonical display order used by summaries.
    pub const ALL: [Status; 10] = [
        Status::Triage,
        Status::Planning,
        Status::Todo,
        Status::InProgress,
        Status::AiReview,
        Status::Rejected,
        Status::InReview,
        Status::Done,
        Status::NeedHuman,
        Status::NoStatus,
    ];

    /// Name of the single-select option on the board.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Triage => "Triage",
            Status::Planning => "Planning",
            Status::Todo => "Todo",
            Status::InProgress => "In Progress",
            Status::AiReview => "AI Review",
            Status::Rejected => "Rejected",
            Status::InReview => "In Review",
            Status::Done => "Done",
            Status::NeedHuman => "Need Human",
            Status::NoStatus => "No Status",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "triage" => Ok(Status::Triage),
            "planning" => Ok(Status::Planning),
            "todo" => Ok(Status::Todo),
            "inprogress" => Ok(Status::InProgress),
            "aireview" => Ok(Status::AiReview),
            "rejected" => Ok(Status::Rejected),
            "inreview" => Ok(Status::InReview),
            "done" => Ok(Status::Done),
            "needhuman" => Ok(Status::NeedHuman),
            "nostatus" | "" => Ok(Status::NoStatus),
            _ => anyhow::bail!("Unknown status '{}'", s),
        }
    }
}

/// A comment on a work item, as fed to agent prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub body: String,
}

/// A board item. Owned by the board; the orchestrator only writes `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    /// Opaque board node id used for status mutations.
    pub node_id: String,
    pub status: Status,
    pub title: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl WorkItem {
    pub fn new(id: ItemId, status: Status, title: impl Into<String>) -> Self {
        Self {
            id,
            node_id: format!("ITEM_{}", id),
            status,
            title: title.into(),
            labels: Vec::new(),
        }
    }

    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.labels = labels.iter().map(|l| l.to_string()).collect();
        self
    }

    /// Label-derived priority weight; lower runs first.
    pub fn priority_weight(&self) -> u32 {
        priority_weight(&self.labels)
    }
}

/// Detail fetched on demand right before dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDetail {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    /// Most recent comments, oldest first.
    pub comments: Vec<Comment>,
}

/// Number of trailing comments carried into prompts.
pub const RECENT_COMMENTS: usize = 5;

/// A change request (pull request) linked to an item's branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub number: u64,
    pub branch: String,
    pub is_draft: bool,
    #[serde(default)]
    pub url: String,
}

/// External API quota as reported by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: Option<DateTime<Utc>>,
}

const PRIORITY_LABELS: [(&str, u32); 4] = [
    ("priority: critical", 1),
    ("priority: high", 10),
    ("priority: medium", 50),
    ("priority: low", 90),
];

/// Weight used when no priority label is present.
pub const DEFAULT_PRIORITY: u32 = 50;

/// First matching priority label wins; matching ignores case.
pub fn priority_weight(labels: &[String]) -> u32 {
    labels
        .iter()
        .find_map(|label| {
            let lower = label.to_lowercase();
            PRIORITY_LABELS
                .iter()
                .find(|(name, _)| *name == lower)
                .map(|(_, weight)| *weight)
        })
        .unwrap_or(DEFAULT_PRIORITY)
}
