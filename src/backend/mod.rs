//! `Backend` trait: abstraction over the shared table store.
//!
//! The worker touches the store through exactly four operations. The
//! conditional update is the only cross-worker coordination primitive:
//! implementations must apply the status guard and the patch as one
//! atomic compare-and-swap on the row.

pub mod rest;

#[cfg(test)]
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::model::{CommandQuery, CommandRow, CommandStatus, ControlsRow, NewEvent};

pub use rest::RestBackend;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Rows matching the query, oldest `created_at` first, at most `query.limit`.
    async fn list_commands(&self, query: &CommandQuery) -> Result<Vec<CommandRow>>;

    /// Applies `patch` to the row `id` only if its status is still
    /// `expected`. Returns the number of rows changed (0 or 1).
    async fn update_command(&self, id: &str, expected: CommandStatus, patch: &Value) -> Result<usize>;

    /// Appends an audit event.
    async fn insert_event(&self, event: &NewEvent) -> Result<()>;

    /// The project's `global` controls row, if one exists.
    async fn select_controls(&self, project_id: &str) -> Result<Option<ControlsRow>>;
}
