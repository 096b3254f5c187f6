//! GitHub Projects board backed by the `gh` CLI.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;

use super::models::{
    ChangeRequest, Comment, ItemDetail, ItemId, RECENT_COMMENTS, RateLimit, Status, WorkItem,
};
use super::Board;
use crate::config::BoardSection;
use crate::errors::BoardError;

#[derive(Debug, Deserialize)]
struct ItemList {
    #[serde(default)]
    items: Vec<RawItem>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    content: Option<RawContent>,
}

#[derive(Debug, Deserialize)]
struct RawContent {
    #[serde(default)]
    number: Option<u64>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<RawLabel>,
    #[serde(default)]
    comments: Vec<RawComment>,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    #[serde(default)]
    author: Option<RawAuthor>,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct RawAuthor {
    login: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPullRequest {
    number: u64,
    #[serde(default)]
    is_draft: bool,
    #[serde(default)]
    url: String,
    #[serde(default)]
    head_ref_name: String,
}

#[derive(Debug, Deserialize)]
struct RawRateLimit {
    resources: RawResources,
}

#[derive(Debug, Deserialize)]
struct RawResources {
    graphql: RawQuota,
}

#[derive(Debug, Deserialize)]
struct RawQuota {
    limit: u64,
    remaining: u64,
    #[serde(default)]
    reset: Option<i64>,
}

/// Board implementation that shells out to `gh`.
pub struct GhBoard {
    config: BoardSection,
    gh_cmd: String,
}

impl GhBoard {
    pub fn new(config: BoardSection) -> Self {
        let gh_cmd = std::env::var("GH_CMD").unwrap_or_else(|_| "gh".to_string());
        Self { config, gh_cmd }
    }

    async fn run(&self, args: &[&str]) -> Result<String, BoardError> {
        let command = format!("{} {}", self.gh_cmd, args.join(" "));
        let secs = self.config.command_timeout_secs;

        let output = Command::new(&self.gh_cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(Duration::from_secs(secs), output).await {
            Ok(result) => result.map_err(BoardError::Spawn)?,
            Err(_) => return Err(BoardError::Timeout { command, secs }),
        };

        if !output.status.success() {
            return Err(BoardError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_json<T: serde::de::DeserializeOwned>(&self, args: &[&str]) -> Result<T, BoardError> {
        let raw = self.run(args).await?;
        let raw = if raw.is_empty() { "null" } else { raw.as_str() };
        serde_json::from_str(raw).map_err(|e| BoardError::InvalidJson {
            command: args.join(" "),
            message: e.to_string(),
        })
    }
}

/// Convert `gh project item-list` output into work items. Entries without an
/// issue number (draft notes) are dropped.
fn parse_item_list(list: ItemList) -> Vec<WorkItem> {
    list.items
        .into_iter()
        .filter_map(|raw| {
            let content = raw.content?;
            let id = content.number?;
            let status = raw
                .status
                .as_deref()
                .and_then(|s| s.parse::<Status>().ok())
                .unwrap_or(Status::NoStatus);
            let title = if raw.title.is_empty() {
                content.title.unwrap_or_default()
            } else {
                raw.title
            };
            Some(WorkItem {
                id,
                node_id: raw.id,
                status,
                title,
                labels: raw.labels,
            })
        })
        .collect()
}

fn parse_issue(raw: RawIssue) -> ItemDetail {
    let skip = raw.comments.len().saturating_sub(RECENT_COMMENTS);
    ItemDetail {
        title: raw.title,
        body: raw.body.unwrap_or_default(),
        labels: raw.labels.into_iter().map(|l| l.name).collect(),
        comments: raw
            .comments
            .into_iter()
            .skip(skip)
            .map(|c| Comment {
                author: c.author.map(|a| a.login).unwrap_or_else(|| "unknown".to_string()),
                body: c.body,
            })
            .collect(),
    }
}

/// `gh pr create` prints the URL of the new pull request; its last path
/// segment is the number.
fn parse_pr_number(url: &str) -> Option<u64> {
    url.trim().trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

#[async_trait]
impl Board for GhBoard {
    async fn list_items(&self) -> Result<Vec<WorkItem>, BoardError> {
        let project = self.config.project_number.to_string();
        let list: ItemList = self
            .run_json(&[
                "project",
                "item-list",
                &project,
                "--owner",
                &self.config.owner,
                "--format",
                "json",
                "--limit",
                "500",
            ])
            .await?;
        Ok(parse_item_list(list))
    }

    async fn item_detail(&self, id: ItemId) -> Result<ItemDetail, BoardError> {
        let number = id.to_string();
        let raw: RawIssue = self
            .run_json(&[
                "issue",
                "view",
                &number,
                "--repo",
                &self.config.repo,
                "--json",
                "title,body,labels,comments",
            ])
            .await?;
        Ok(parse_issue(raw))
    }

    async fn set_status(&self, item: &WorkItem, status: Status) -> Result<(), BoardError> {
        let option_id = self
            .config
            .status_options
            .get(status.as_str())
            .ok_or(BoardError::MissingOption(status))?;
        let query = format!(
            r#"mutation {{
  updateProjectV2ItemFieldValue(input: {{
    projectId: "{}",
    itemId: "{}",
    fieldId: "{}",
    value: {{ singleSelectOptionId: "{}" }}
  }}) {{ projectV2Item {{ id }} }}
}}"#,
            self.config.project_id, item.node_id, self.config.status_field_id, option_id
        );
        let query_arg = format!("query={}", query);
        self.run(&["api", "graphql", "-f", &query_arg]).await?;
        Ok(())
    }

    async fn add_comment(&self, id: ItemId, body: &str) -> Result<(), BoardError> {
        let number = id.to_string();
        self.run(&["issue", "comment", &number, "--repo", &self.config.repo, "--body", body])
            .await?;
        Ok(())
    }

    async fn change_request_for_branch(&self, branch: &str) -> Result<Option<ChangeRequest>, BoardError> {
        let prs: Option<Vec<RawPullRequest>> = self
            .run_json(&[
                "pr",
                "list",
                "--repo",
                &self.config.repo,
                "--head",
                branch,
                "--state",
                "open",
                "--json",
                "number,isDraft,url,headRefName",
            ])
            .await?;
        Ok(prs.unwrap_or_default().into_iter().next().map(|pr| ChangeRequest {
            number: pr.number,
            branch: if pr.head_ref_name.is_empty() { branch.to_string() } else { pr.head_ref_name },
            is_draft: pr.is_draft,
            url: pr.url,
        }))
    }

    async fn create_draft_change_request(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<ChangeRequest, BoardError> {
        let url = self
            .run(&[
                "pr",
                "create",
                "--repo",
                &self.config.repo,
                "--draft",
                "--head",
                branch,
                "--base",
                base,
                "--title",
                title,
                "--body",
                body,
            ])
            .await?;
        let number = parse_pr_number(&url).ok_or_else(|| BoardError::InvalidJson {
            command: "pr create".to_string(),
            message: format!("could not read pull request number from '{}'", url),
        })?;
        Ok(ChangeRequest {
            number,
            branch: branch.to_string(),
            is_draft: true,
            url,
        })
    }

    async fn approve_change_request(&self, number: u64, body: &str) -> Result<(), BoardError> {
        let number = number.to_string();
        self.run(&["pr", "review", &number, "--repo", &self.config.repo, "--approve", "--body", body])
            .await?;
        Ok(())
    }

    async fn request_changes(&self, number: u64, body: &str) -> Result<(), BoardError> {
        let number = number.to_string();
        self.run(&[
            "pr",
            "review",
            &number,
            "--repo",
            &self.config.repo,
            "--request-changes",
            "--body",
            body,
        ])
        .await?;
        Ok(())
    }

    async fn merge_change_request(&self, number: u64) -> Result<(), BoardError> {
        let number = number.to_string();
        self.run(&["pr", "merge", &number, "--repo", &self.config.repo, "--squash", "--delete-branch"])
            .await?;
        Ok(())
    }

    async fn close_change_request(&self, number: u64, comment: &str) -> Result<(), BoardError> {
        let number = number.to_string();
        self.run(&["pr", "close", &number, "--repo", &self.config.repo, "--comment", comment])
            .await?;
        Ok(())
    }

    async fn rate_limit(&self) -> Result<RateLimit, BoardError> {
        let raw: RawRateLimit = self.run_json(&["api", "rate_limit"]).await?;
        let quota = raw.resources.graphql;
        Ok(RateLimit {
            remaining: quota.remaining,
            limit: quota.limit,
            reset_at: quota.reset.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        })
    }

    fn item_url(&self, id: ItemId) -> String {
        format!("https://github.com/{}/issues/{}", self.config.repo, id)
    }
}
