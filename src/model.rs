//! Row shapes exchanged with the table store.
//!
//! Field names match the `commands`, `controls` and `events` tables
//! column for column so rows deserialize without adapters.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a command row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Queued,
    NeedsApproval,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Queued => "queued",
            CommandStatus::NeedsApproval => "needs_approval",
            CommandStatus::Running => "running",
            CommandStatus::Done => "done",
            CommandStatus::Failed => "failed",
            CommandStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Done | CommandStatus::Failed | CommandStatus::Cancelled
        )
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the `commands` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRow {
    pub id: String,
    pub project_id: String,
    pub node_id: String,
    pub command: String,
    #[serde(default)]
    pub payload: Option<Value>,
    pub status: CommandStatus,
    #[serde(default)]
    pub needs_approval: bool,
    #[serde(default)]
    pub signature: Option<String>,
    /// Kept as the stored text: it is part of the signed envelope.
    pub created_at: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CommandRow {
    /// The exact tuple covered by the signature.
    pub fn envelope(&self) -> Envelope<'_> {
        Envelope {
            id: &self.id,
            project_id: &self.project_id,
            node_id: &self.node_id,
            command: &self.command,
            payload: self.payload.as_ref(),
            created_at: &self.created_at,
        }
    }
}

/// Borrowed view over the signed fields of a command.
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    pub id: &'a str,
    pub project_id: &'a str,
    pub node_id: &'a str,
    pub command: &'a str,
    pub payload: Option<&'a Value>,
    pub created_at: &'a str,
}

/// The per-project governance row, as stored.
///
/// Every column is optional: a null column counts as "not granted".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlsRow {
    #[serde(default)]
    pub kill_switch: Option<bool>,
    #[serde(default)]
    pub allow_shell: Option<bool>,
    #[serde(default)]
    pub allow_write: Option<bool>,
    #[serde(default)]
    pub allow_fs: Option<bool>,
}

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// A row to append to the `events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub project_id: String,
    pub node_id: String,
    pub level: EventLevel,
    #[serde(rename = "type")]
    pub event_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Filter for `list_commands`. Mirrors the eligible-commands query.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandQuery {
    pub project_id: String,
    pub node_id: String,
    pub status: CommandStatus,
    pub needs_approval: bool,
    pub limit: usize,
}
