/// Command lifecycle: eligible-row listing, atomic claim, terminal transitions.
///
/// ```text
/// queued ──claim──▶ running ──▶ done | failed | cancelled
/// ```
///
/// Every update is guarded by the status the row must currently have, so
/// a row only ever moves forward and only one worker can own it. Each
/// transition appends one audit event; event failures are logged and do
/// not affect the transition.
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::CommandError;
use crate::model::{CommandQuery, CommandRow, CommandStatus, EventLevel, NewEvent};

/// Result of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This worker now owns the command.
    Claimed,
    /// Another worker changed the row first. Not an error.
    Conflict,
}

pub struct Lifecycle {
    backend: Arc<dyn Backend>,
    project_id: String,
    node_id: String,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Lifecycle {
    pub fn new(backend: Arc<dyn Backend>, project_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            backend,
            project_id: project_id.into(),
            node_id: node_id.into(),
        }
    }

    /// Queued, approved commands for this worker, oldest first.
    pub async fn list_eligible(&self, limit: usize) -> Result<Vec<CommandRow>> {
        let query = CommandQuery {
            project_id: self.project_id.clone(),
            node_id: self.node_id.clone(),
            status: CommandStatus::Queued,
            needs_approval: false,
            limit,
        };
        let mut rows = self.backend.list_commands(&query).await?;
        // Order by instant, not text: stores may mix offsets and precision.
        // Unparseable timestamps go last; the sort is stable.
        rows.sort_by_cached_key(|row| {
            let instant = DateTime::parse_from_rfc3339(&row.created_at)
                .ok()
                .map(|t| t.with_timezone(&Utc));
            (instant.is_none(), instant)
        });
        rows.truncate(limit);
        Ok(rows)
    }

    /// Compare-and-swap `queued → running`.
    pub async fn claim(&self, row: &CommandRow) -> Result<ClaimOutcome> {
        let patch = json!({
            "status": CommandStatus::Running,
            "started_at": now(),
        });
        let affected = self
            .backend
            .update_command(&row.id, CommandStatus::Queued, &patch)
            .await?;

        if affected == 0 {
            debug!("Command {} already claimed elsewhere, skipping", row.id);
            return Ok(ClaimOutcome::Conflict);
        }

        info!("Claimed command {} ({})", row.id, row.command);
        self.record(
            EventLevel::Info,
            "command.started",
            format!("Command {} started", row.command),
            json!({ "command_id": row.id, "command": row.command }),
        )
        .await;
        Ok(ClaimOutcome::Claimed)
    }

    /// `running → done` with a result.
    pub async fn finish_ok(&self, row: &CommandRow, result: Value) -> Result<()> {
        let patch = json!({
            "status": CommandStatus::Done,
            "result": result,
            "error": null,
            "finished_at": now(),
        });
        if !self.transition(row, &patch).await? {
            return Ok(());
        }
        info!("Command {} ({}) done", row.id, row.command);
        self.record(
            EventLevel::Info,
            "command.done",
            format!("Command {} completed", row.command),
            json!({ "command_id": row.id, "command": row.command }),
        )
        .await;
        Ok(())
    }

    /// `running → failed` with an error message.
    pub async fn finish_fail(&self, row: &CommandRow, error: &CommandError) -> Result<()> {
        let message = error.to_string();
        let patch = json!({
            "status": CommandStatus::Failed,
            "result": null,
            "error": message,
            "finished_at": now(),
        });
        if !self.transition(row, &patch).await? {
            return Ok(());
        }
        warn!("Command {} ({}) failed: {message}", row.id, row.command);
        self.record(
            error.event_level(),
            "command.failed",
            format!("Command {} failed: {message}", row.command),
            json!({ "command_id": row.id, "command": row.command, "reason": error.code() }),
        )
        .await;
        Ok(())
    }

    /// `running → cancelled`. Only for authentication or governance rejections.
    pub async fn cancel(&self, row: &CommandRow, reason: &CommandError) -> Result<()> {
        let message = reason.to_string();
        let patch = json!({
            "status": CommandStatus::Cancelled,
            "result": null,
            "error": message,
            "finished_at": now(),
        });
        if !self.transition(row, &patch).await? {
            return Ok(());
        }
        warn!("Command {} ({}) cancelled: {message}", row.id, row.command);
        self.record(
            reason.event_level(),
            "command.cancelled",
            format!("Command {} cancelled: {message}", row.command),
            json!({ "command_id": row.id, "command": row.command, "reason": reason.code() }),
        )
        .await;
        Ok(())
    }

    /// Routes an error to the terminal state it maps to.
    pub async fn reject(&self, row: &CommandRow, error: &CommandError) -> Result<()> {
        match error.terminal_status() {
            CommandStatus::Cancelled => self.cancel(row, error).await,
            _ => self.finish_fail(row, error).await,
        }
    }

    /// Applies a terminal patch to a running row. False when the row had
    /// already left `running` (e.g. cancelled externally).
    async fn transition(&self, row: &CommandRow, patch: &Value) -> Result<bool> {
        let affected = self
            .backend
            .update_command(&row.id, CommandStatus::Running, patch)
            .await?;
        if affected == 0 {
            warn!("Command {} was no longer running, outcome not recorded", row.id);
            return Ok(false);
        }
        Ok(true)
    }

    /// Appends an audit event, best effort.
    async fn record(&self, level: EventLevel, event_type: &str, message: String, data: Value) {
        let event = NewEvent {
            project_id: self.project_id.clone(),
            node_id: self.node_id.clone(),
            level,
            event_type: event_type.to_string(),
            message,
            data: Some(data),
        };
        if let Err(e) = self.backend.insert_event(&event).await {
            warn!("Failed to record {event_type} event: {e}");
        }
    }
}
