use thiserror::Error;

use crate::model::{CommandStatus, EventLevel};

/// Terminal rejection or failure of a claimed command.
///
/// Each variant ends the command in exactly one terminal state. Losing a
/// claim race is not represented here: see `ClaimOutcome::Conflict`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("blocked by governance: {0}")]
    GovernanceBlocked(String),
    #[error("path escapes sandbox root: {0}")]
    PathTraversal(String),
    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("execution timed out after {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl CommandError {
    /// Stable identifier recorded in event data.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::SignatureInvalid => "signature_invalid",
            CommandError::GovernanceBlocked(_) => "governance_blocked",
            CommandError::PathTraversal(_) => "path_traversal",
            CommandError::CommandNotAllowed(_) => "command_not_allowed",
            CommandError::InvalidPayload(_) => "invalid_payload",
            CommandError::ExecutionTimeout { .. } => "execution_timeout",
            CommandError::ExecutionFailed(_) => "execution_failed",
        }
    }

    /// Authentication and governance rejections cancel; everything else fails.
    pub fn terminal_status(&self) -> CommandStatus {
        match self {
            CommandError::SignatureInvalid | CommandError::GovernanceBlocked(_) => {
                CommandStatus::Cancelled
            }
            _ => CommandStatus::Failed,
        }
    }

    pub fn event_level(&self) -> EventLevel {
        if self.is_security_event() {
            EventLevel::Error
        } else {
            EventLevel::Warn
        }
    }

    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            CommandError::SignatureInvalid | CommandError::PathTraversal(_)
        )
    }
}

impl From<std::io::Error> for CommandError {
    fn from(e: std::io::Error) -> Self {
        CommandError::ExecutionFailed(e.to_string())
    }
}
