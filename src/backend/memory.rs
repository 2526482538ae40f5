//! In-process table store used by tests.

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::Backend;
use crate::model::{CommandQuery, CommandRow, CommandStatus, ControlsRow, NewEvent};

#[derive(Default)]
pub struct MemoryBackend {
    commands: Mutex<Vec<CommandRow>>,
    events: Mutex<Vec<NewEvent>>,
    controls: Mutex<Option<ControlsRow>>,
    fail_reads: Mutex<bool>,
    fail_events: Mutex<bool>,
    /// Remaining `running → *` updates that fail before the store heals.
    failing_terminal_updates: Mutex<u32>,
    /// Controls swapped in as soon as a claim succeeds.
    controls_after_claim: Mutex<Option<ControlsRow>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_command(&self, row: CommandRow) {
        self.commands.lock().unwrap().push(row);
    }

    pub fn command(&self, id: &str) -> Option<CommandRow> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn events(&self) -> Vec<NewEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn set_controls(&self, controls: Option<ControlsRow>) {
        *self.controls.lock().unwrap() = controls;
    }

    /// Makes `list_commands` and `select_controls` fail.
    pub fn set_fail_reads(&self, fail: bool) {
        *self.fail_reads.lock().unwrap() = fail;
    }

    pub fn set_fail_events(&self, fail: bool) {
        *self.fail_events.lock().unwrap() = fail;
    }

    /// Makes the next `n` updates guarded on `running` fail.
    pub fn fail_terminal_updates(&self, n: u32) {
        *self.failing_terminal_updates.lock().unwrap() = n;
    }

    /// Replaces the controls row right after the next successful claim.
    pub fn set_controls_after_claim(&self, controls: ControlsRow) {
        *self.controls_after_claim.lock().unwrap() = Some(controls);
    }

    fn check_reads(&self) -> Result<()> {
        if *self.fail_reads.lock().unwrap() {
            return Err(anyhow!("backend unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn list_commands(&self, query: &CommandQuery) -> Result<Vec<CommandRow>> {
        self.check_reads()?;
        let mut rows: Vec<CommandRow> = self
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                r.project_id == query.project_id
                    && r.node_id == query.node_id
                    && r.status == query.status
                    && r.needs_approval == query.needs_approval
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows.truncate(query.limit);
        Ok(rows)
    }

    async fn update_command(&self, id: &str, expected: CommandStatus, patch: &Value) -> Result<usize> {
        if expected == CommandStatus::Running {
            let mut failing = self.failing_terminal_updates.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(anyhow!("transient 503 from table store"));
            }
        }

        let mut commands = self.commands.lock().unwrap();
        let Some(row) = commands
            .iter_mut()
            .find(|r| r.id == id && r.status == expected)
        else {
            return Ok(0);
        };

        let mut value = serde_json::to_value(&*row)?;
        let (Value::Object(target), Value::Object(changes)) = (&mut value, patch) else {
            return Err(anyhow!("patch must be an object"));
        };
        for (key, change) in changes {
            target.insert(key.clone(), change.clone());
        }
        *row = serde_json::from_value(value)?;

        if expected == CommandStatus::Queued {
            if let Some(next) = self.controls_after_claim.lock().unwrap().take() {
                *self.controls.lock().unwrap() = Some(next);
            }
        }
        Ok(1)
    }

    async fn insert_event(&self, event: &NewEvent) -> Result<()> {
        if *self.fail_events.lock().unwrap() {
            return Err(anyhow!("events table unavailable"));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn select_controls(&self, _project_id: &str) -> Result<Option<ControlsRow>> {
        self.check_reads()?;
        Ok(self.controls.lock().unwrap().clone())
    }
}
