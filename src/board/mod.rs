//! Tracking-board abstraction.
//!
//! The board is the single source of truth for item status. Every loop reads
//! it through the `StatusCache` and writes it through `Board::set_status`;
//! no loop owns an item exclusively.
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `models`      | `Status`, `WorkItem`, `ChangeRequest`, `RateLimit`      |
//! | `transitions` | Legal status edges                                      |
//! | `gh`          | `GhBoard`, GitHub Projects via the `gh` CLI             |
//! | `writer`      | `StatusWriter`, the validated status write path         |

pub mod gh;
pub mod models;
pub mod transitions;
pub mod writer;

use async_trait::async_trait;

use crate::errors::BoardError;

pub use gh::GhBoard;
pub use writer::StatusWriter;
pub use models::{
    ChangeRequest, Comment, ItemDetail, ItemId, RateLimit, Status, WorkItem, priority_weight,
};

/// Read/write surface of the tracking board.
/// Real implementation: `GhBoard`. Test double: `testing::MemoryBoard`.
#[async_trait]
pub trait Board: Send + Sync {
    /// All non-archived items with their current status.
    async fn list_items(&self) -> Result<Vec<WorkItem>, BoardError>;

    /// Body, labels and recent comments for one item.
    async fn item_detail(&self, id: ItemId) -> Result<ItemDetail, BoardError>;

    async fn set_status(&self, item: &WorkItem, status: Status) -> Result<(), BoardError>;

    async fn add_comment(&self, id: ItemId, body: &str) -> Result<(), BoardError>;

    /// The open change request whose head is `branch`, if any.
    async fn change_request_for_branch(&self, branch: &str) -> Result<Option<ChangeRequest>, BoardError>;

    async fn create_draft_change_request(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<ChangeRequest, BoardError>;

    async fn approve_change_request(&self, number: u64, body: &str) -> Result<(), BoardError>;

    async fn request_changes(&self, number: u64, body: &str) -> Result<(), BoardError>;

    async fn merge_change_request(&self, number: u64) -> Result<(), BoardError>;

    async fn close_change_request(&self, number: u64, comment: &str) -> Result<(), BoardError>;

    async fn rate_limit(&self) -> Result<RateLimit, BoardError>;

    /// Human-facing link to an item.
    fn item_url(&self, id: ItemId) -> String;
}
