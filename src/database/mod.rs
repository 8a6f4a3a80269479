//! Protected Log Storage
//!
//! The durable row store behind the chains. Writes go through their own
//! connection in autocommit mode so an appended entry outlives any business
//! transaction that produced it.

pub mod memory;
pub mod models;
pub mod sqlite;

pub use memory::MemoryLogStore;
pub use models::{ChainBoundary, ExportCursor, LogQuery};
pub use sqlite::SqliteLogStore;

use crate::audit::entry::{LogEntry, Protection};
use crate::error::Result;

#[async_trait::async_trait]
pub trait LogStore: Send + Sync {
    /// Insert a new entry. Fails if `(node_id, sequence_number)` already exists.
    async fn append(&self, entry: &LogEntry) -> Result<()>;

    async fn query(&self, query: &LogQuery) -> Result<Vec<LogEntry>>;

    /// Highest-sequence entry of `node_id`, or the most recent entry of any
    /// node when `None`.
    async fn newest_entry(&self, node_id: Option<&str>) -> Result<Option<LogEntry>>;

    async fn node_ids(&self) -> Result<Vec<String>>;

    async fn count(&self) -> Result<u64>;

    /// Attach a checkpoint signature to an existing entry.
    async fn set_protection(
        &self,
        node_id: &str,
        sequence_number: u64,
        protection: &Protection,
    ) -> Result<()>;

    async fn remove_node(&self, node_id: &str) -> Result<u64>;

    async fn remove_all(&self) -> Result<u64>;

    async fn load_cursor(&self, destination: &str) -> Result<Option<ExportCursor>>;

    async fn save_cursor(&self, destination: &str, cursor: &ExportCursor) -> Result<()>;

    async fn reset_epoch(&self) -> Result<u64>;

    /// Bump and return the reset epoch.
    async fn advance_reset_epoch(&self) -> Result<u64>;
}
