//! Human notification on escalation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::board::{Board, ItemId};

/// What a human is being asked to look at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Escalation {
    pub item: ItemId,
    pub title: String,
    pub reason: String,
    pub url: String,
}

impl Escalation {
    pub fn message(&self) -> String {
        format!(
            "**Escalated to Need Human**\n\n{}\n\n#{} {} ({})",
            self.reason, self.item, self.title, self.url
        )
    }
}

/// Sink for escalations.
/// Real implementations: `BoardCommentNotifier`, `WebhookNotifier`.
/// Test double: `testing::RecordingNotifier`.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, escalation: &Escalation) -> Result<()>;
}

/// Leaves a comment on the escalated item.
pub struct BoardCommentNotifier {
    board: Arc<dyn Board>,
}

impl BoardCommentNotifier {
    pub fn new(board: Arc<dyn Board>) -> Self {
        Self { board }
    }
}

#[async_trait]
impl Notifier for BoardCommentNotifier {
    async fn notify(&self, escalation: &Escalation) -> Result<()> {
        self.board
            .add_comment(escalation.item, &escalation.message())
            .await
            .context("Failed to comment escalation on the board")
    }
}

/// POSTs the escalation as JSON to a configured URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("devloop/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, escalation: &Escalation) -> Result<()> {
        self.client
            .post(&self.url)
            .json(escalation)
            .send()
            .await
            .context("Failed to send escalation webhook")?
            .error_for_status()
            .context("Escalation webhook returned error status")?;
        Ok(())
    }
}

/// Delivers to every notifier concurrently; one failing sink does not block the rest.
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Arc<dyn Notifier>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, escalation: &Escalation) -> Result<()> {
        let results = futures::future::join_all(self.sinks.iter().map(|sink| sink.notify(escalation))).await;
        let mut failures = 0;
        for e in results.into_iter().filter_map(|r| r.err()) {
            failures += 1;
            tracing::warn!(item = escalation.item, error = %format!("{:#}", e), "Escalation notification failed");
        }
        if failures > 0 && failures == self.sinks.len() {
            anyhow::bail!("All {} notification sinks failed", failures);
        }
        Ok(())
    }
}

/// Board comment always; webhook when configured.
pub fn from_config(board: Arc<dyn Board>, webhook_url: Option<&str>) -> Result<Arc<dyn Notifier>> {
    let mut sinks: Vec<Arc<dyn Notifier>> = vec![Arc::new(BoardCommentNotifier::new(board))];
    if let Some(url) = webhook_url.filter(|u| !u.trim().is_empty()) {
        sinks.push(Arc::new(WebhookNotifier::new(url)?));
    }
    Ok(Arc::new(FanoutNotifier::new(sinks)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryBoard, RecordingNotifier};

    fn escalation() -> Escalation {
        Escalation {
            item: 7,
            title: "Flaky login".into(),
            reason: "Rejected 2 times in review".into(),
            url: "https://github.com/acme/widgets/issues/7".into(),
        }
    }

    #[test]
    fn webhook_payload_shape() {
        let json = serde_json::to_value(escalation()).unwrap();
        assert_eq!(json["item"], 7);
        assert_eq!(json["title"], "Flaky login");
        assert_eq!(json["reason"], "Rejected 2 times in review");
        assert!(json["url"].as_str().unwrap().ends_with("/issues/7"));
    }

    #[tokio::test]
    async fn board_comment_names_the_reason() {
        let board = Arc::new(MemoryBoard::new());
        let notifier = BoardCommentNotifier::new(board.clone());
        notifier.notify(&escalation()).await.unwrap();
        let comments = board.comments(7);
        assert_eq!(comments.len(), 1);
        assert!(comments[0].contains("Rejected 2 times in review"));
    }

    #[tokio::test]
    async fn fanout_survives_a_failing_sink() {
        let failing = Arc::new(RecordingNotifier::failing());
        let ok = Arc::new(RecordingNotifier::new());
        let fanout = FanoutNotifier::new(vec![failing.clone(), ok.clone()]);
        fanout.notify(&escalation()).await.unwrap();
        assert_eq!(ok.escalations().len(), 1);
    }

    #[tokio::test]
    async fn fanout_errors_when_every_sink_fails() {
        let fanout = FanoutNotifier::new(vec![Arc::new(RecordingNotifier::failing())]);
        assert!(fanout.notify(&escalation()).await.is_err());
    }

    #[test]
    fn from_config_ignores_blank_webhook() {
        let board: Arc<dyn Board> = Arc::new(MemoryBoard::new());
        assert!(from_config(board.clone(), Some("  ")).is_ok());
        assert!(from_config(board, Some("https://hooks.example.com/x")).is_ok());
    }
}
