//! Direct board inspection and edits: `devloop board`.
//!
//! Every subcommand reads the live board, so `board.repo` must be set.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use devloop::board::{Board, GhBoard, ItemId, Status, StatusWriter};
use devloop::cache::StatusCache;
use devloop::loops::implement::implementation_order;
use devloop::retry::{RetryConfig, retry_transient};

use super::super::BoardCommands;

pub async fn cmd_board(project_dir: &Path, command: BoardCommands) -> Result<()> {
    let (config, _) = super::load(project_dir)?;
    config.validate().context("Invalid configuration")?;

    let board: Arc<dyn Board> = Arc::new(GhBoard::new(config.board.clone()));
    let console = BoardConsole::new(board, config.retry.clone());
    let output = match command {
        BoardCommands::Summary => console.summary().await?,
        BoardCommands::List { status, count } => console.list(parse_status(&status)?, count).await?,
        BoardCommands::SetStatus { item, status } => console.set_status(item, parse_status(&status)?).await?,
        BoardCommands::Context { item } => console.context(item).await?,
        BoardCommands::Queue => console.queue().await?,
    };
    print!("{}", output);
    Ok(())
}

fn parse_status(name: &str) -> Result<Status> {
    name.parse::<Status>()
        .with_context(|| format!("Expected one of: {}", status_names()))
}

fn status_names() -> String {
    Status::ALL.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
}

/// One-shot board operations. Each returns the text to print.
struct BoardConsole {
    board: Arc<dyn Board>,
    cache: Arc<StatusCache>,
    writer: StatusWriter,
    retry: RetryConfig,
}

impl BoardConsole {
    fn new(board: Arc<dyn Board>, retry: RetryConfig) -> Self {
        // One command, one listing.
        let cache = Arc::new(StatusCache::new(Arc::clone(&board), std::time::Duration::from_secs(3600)));
        let writer = StatusWriter::new(Arc::clone(&board), Arc::clone(&cache), retry.clone());
        Self {
            board,
            cache,
            writer,
            retry,
        }
    }

    /// Non-zero counts in canonical order.
    async fn summary(&self) -> Result<String> {
        let counts: Vec<_> = self.cache.counts().await?.into_iter().filter(|(_, n)| *n > 0).collect();
        if counts.is_empty() {
            return Ok("No items on the board\n".to_string());
        }
        Ok(counts
            .into_iter()
            .map(|(status, n)| format!("{}: {}\n", status, n))
            .collect())
    }

    async fn list(&self, status: Status, count: bool) -> Result<String> {
        let items = self.cache.list_by_status(status).await?;
        if count {
            return Ok(format!("{}\n", items.len()));
        }
        Ok(items.iter().map(|item| format!("{}\n", item.id)).collect())
    }

    /// Validated write-through transition.
    async fn set_status(&self, id: ItemId, to: Status) -> Result<String> {
        let item = self
            .cache
            .get(id)
            .await?
            .with_context(|| format!("Item #{} is not on the board", id))?;
        let from = item.status;
        self.writer.transition(&item, to).await?;
        Ok(format!("#{}: {} -> {}\n", id, from, to))
    }

    /// Item, detail and link as JSON, ready to paste into a prompt.
    async fn context(&self, id: ItemId) -> Result<String> {
        let item = self
            .cache
            .get(id)
            .await?
            .with_context(|| format!("Item #{} is not on the board", id))?;
        let detail = retry_transient("item detail", &self.retry, || self.board.item_detail(id)).await?;
        let context = serde_json::json!({
            "item": id,
            "status": item.status.as_str(),
            "title": detail.title,
            "body": detail.body,
            "labels": detail.labels,
            "comments": detail.comments,
            "url": self.board.item_url(id),
        });
        Ok(format!("{}\n", serde_json::to_string_pretty(&context)?))
    }

    /// What the implement loop would pick up next, in order.
    async fn queue(&self) -> Result<String> {
        let order = implementation_order(
            self.cache.list_by_status(Status::Rejected).await?,
            self.cache.list_by_status(Status::Todo).await?,
        );
        if order.is_empty() {
            return Ok("Nothing waiting for implementation\n".to_string());
        }
        Ok(order
            .into_iter()
            .map(|item| format!("#{:<6} {:<10} {}\n", item.id, item.status.as_str(), item.title))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devloop::board::WorkItem;
    use devloop::testing::MemoryBoard;

    fn console(board: &Arc<MemoryBoard>) -> BoardConsole {
        BoardConsole::new(board.clone(), RetryConfig::immediate(2))
    }

    #[tokio::test]
    async fn summary_lists_non_zero_counts_in_order() {
        let board = Arc::new(MemoryBoard::new());
        board.insert(WorkItem::new(1, Status::Done, "a"));
        board.insert(WorkItem::new(2, Status::Triage, "b"));
        board.insert(WorkItem::new(3, Status::Triage, "c"));

        let out = console(&board).summary().await.unwrap();
        assert_eq!(out, "Triage: 2\nDone: 1\n");
    }

    #[tokio::test]
    async fn summary_of_empty_board() {
        let board = Arc::new(MemoryBoard::new());
        assert!(console(&board).summary().await.unwrap().contains("No items"));
    }

    #[tokio::test]
    async fn list_and_count_by_status() {
        let board = Arc::new(MemoryBoard::new());
        board.insert(WorkItem::new(9, Status::Todo, "a"));
        board.insert(WorkItem::new(4, Status::Todo, "b"));
        board.insert(WorkItem::new(5, Status::Done, "c"));

        let c = console(&board);
        assert_eq!(c.list(Status::Todo, false).await.unwrap(), "4\n9\n");
        assert_eq!(c.list(Status::Todo, true).await.unwrap(), "2\n");
    }

    #[tokio::test]
    async fn set_status_writes_legal_edges_only() {
        let board = Arc::new(MemoryBoard::new());
        board.insert(WorkItem::new(3, Status::NeedHuman, "x"));
        let c = console(&board);

        let out = c.set_status(3, Status::Todo).await.unwrap();
        assert_eq!(out, "#3: Need Human -> Todo\n");
        assert_eq!(board.status_of(3), Some(Status::Todo));

        assert!(c.set_status(3, Status::Done).await.is_err());
        assert_eq!(board.status_of(3), Some(Status::Todo));
        assert!(c.set_status(99, Status::Todo).await.is_err());
    }

    #[tokio::test]
    async fn context_is_json_with_detail() {
        let board = Arc::new(MemoryBoard::new());
        board.insert(WorkItem::new(12, Status::Planning, "Cache misses").with_labels(&["bug"]));

        let out = console(&board).context(12).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["item"], 12);
        assert_eq!(value["status"], "Planning");
        assert_eq!(value["title"], "Cache misses");
        assert_eq!(value["labels"][0], "bug");
    }

    #[tokio::test]
    async fn queue_puts_rejected_first() {
        let board = Arc::new(MemoryBoard::new());
        board.insert(WorkItem::new(1, Status::Todo, "plain"));
        board.insert(WorkItem::new(2, Status::Todo, "urgent").with_labels(&["priority: high"]));
        board.insert(WorkItem::new(8, Status::Rejected, "rework"));

        let out = console(&board).queue().await.unwrap();
        let ids: Vec<&str> = out.lines().filter_map(|l| l.split_whitespace().next()).collect();
        assert_eq!(ids, vec!["#8", "#2", "#1"]);
    }

    #[test]
    fn unknown_status_names_the_choices() {
        let err = parse_status("Shipped").unwrap_err();
        assert!(format!("{:#}", err).contains("In Progress"));
    }
}
