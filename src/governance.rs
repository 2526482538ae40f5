/// Governance gate: the per-project kill switch and capability flags.
///
/// Controls fail closed. A read error, a missing row, or a null column
/// all resolve to the restrictive value: the kill switch counts as
/// engaged unless the store explicitly says `false`, and a capability is
/// granted only when the store explicitly says `true`.
use std::sync::Arc;

use tracing::warn;

use crate::backend::Backend;
use crate::error::CommandError;
use crate::model::ControlsRow;

/// Effective governance state for one decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    pub kill_switch: bool,
    pub allow_shell: bool,
    /// Granted by either `allow_write` or `allow_fs`.
    pub allow_write: bool,
}

impl Controls {
    /// The state assumed when no readable record exists.
    pub fn locked_down() -> Self {
        Self {
            kill_switch: true,
            allow_shell: false,
            allow_write: false,
        }
    }

    pub fn from_row(row: &ControlsRow) -> Self {
        Self {
            kill_switch: row.kill_switch != Some(false),
            allow_shell: row.allow_shell == Some(true),
            allow_write: row.allow_write == Some(true) || row.allow_fs == Some(true),
        }
    }

    /// Whether new commands may be claimed. Running commands are never preempted.
    pub fn admit_dequeue(&self) -> bool {
        !self.kill_switch
    }

    pub fn require_shell(&self) -> Result<(), CommandError> {
        if self.allow_shell {
            Ok(())
        } else {
            Err(CommandError::GovernanceBlocked(
                "shell execution is disabled (allow_shell)".to_string(),
            ))
        }
    }

    pub fn require_write(&self) -> Result<(), CommandError> {
        if self.allow_write {
            Ok(())
        } else {
            Err(CommandError::GovernanceBlocked(
                "filesystem writes are disabled (allow_write)".to_string(),
            ))
        }
    }
}

/// Reads the project's controls row from the store.
pub struct GovernanceGate {
    backend: Arc<dyn Backend>,
    project_id: String,
}

impl GovernanceGate {
    pub fn new(backend: Arc<dyn Backend>, project_id: impl Into<String>) -> Self {
        Self {
            backend,
            project_id: project_id.into(),
        }
    }

    /// Current controls, surfacing store errors. A missing row is `locked_down()`.
    pub async fn fetch_controls(&self) -> anyhow::Result<Controls> {
        match self.backend.select_controls(&self.project_id).await? {
            Some(row) => Ok(Controls::from_row(&row)),
            None => {
                warn!(
                    "No controls row for project {}, treating as kill switch engaged",
                    self.project_id
                );
                Ok(Controls::locked_down())
            }
        }
    }

    /// Current controls. Never fails: unreadable state is `locked_down()`.
    pub async fn read_controls(&self) -> Controls {
        match self.fetch_controls().await {
            Ok(controls) => controls,
            Err(e) => {
                warn!("Cannot read controls for project {}: {e}", self.project_id);
                Controls::locked_down()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn row(kill: Option<bool>, shell: Option<bool>, write: Option<bool>, fs: Option<bool>) -> ControlsRow {
        ControlsRow {
            kill_switch: kill,
            allow_shell: shell,
            allow_write: write,
            allow_fs: fs,
        }
    }

    #[test]
    fn test_explicit_values() {
        let c = Controls::from_row(&row(Some(false), Some(true), Some(true), None));
        assert!(c.admit_dequeue());
        assert!(c.require_shell().is_ok());
        assert!(c.require_write().is_ok());
    }

    #[test]
    fn test_null_columns_fail_closed() {
        let c = Controls::from_row(&row(None, None, None, None));
        assert!(!c.admit_dequeue());
        assert!(matches!(c.require_shell(), Err(CommandError::GovernanceBlocked(_))));
        assert!(matches!(c.require_write(), Err(CommandError::GovernanceBlocked(_))));
    }

    #[test]
    fn test_allow_fs_is_alias_for_write() {
        let c = Controls::from_row(&row(Some(false), Some(false), None, Some(true)));
        assert!(c.require_write().is_ok());
        assert!(c.require_shell().is_err());
    }

    #[test]
    fn test_kill_switch_blocks_dequeue() {
        let c = Controls::from_row(&row(Some(true), Some(true), Some(true), None));
        assert!(!c.admit_dequeue());
        // Capabilities are independent of the kill switch
        assert!(c.require_shell().is_ok());
    }

    #[tokio::test]
    async fn test_read_controls_from_store() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_controls(Some(row(Some(false), Some(true), None, None)));
        let gate = GovernanceGate::new(backend, "p1");
        let c = gate.read_controls().await;
        assert!(c.admit_dequeue());
        assert!(c.allow_shell);
        assert!(!c.allow_write);
    }

    #[tokio::test]
    async fn test_missing_row_is_locked_down() {
        let backend = Arc::new(MemoryBackend::new());
        let gate = GovernanceGate::new(backend, "p1");
        assert_eq!(gate.read_controls().await, Controls::locked_down());
    }

    #[tokio::test]
    async fn test_read_failure_is_locked_down() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_controls(Some(row(Some(false), Some(true), Some(true), None)));
        backend.set_fail_reads(true);
        let gate = GovernanceGate::new(backend, "p1");
        assert!(gate.fetch_controls().await.is_err());
        assert_eq!(gate.read_controls().await, Controls::locked_down());
    }
}
