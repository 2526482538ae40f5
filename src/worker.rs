use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::backoff::Backoff;
use crate::config::Config;
use crate::error::CommandError;
use crate::governance::GovernanceGate;
use crate::lifecycle::{ClaimOutcome, Lifecycle};
use crate::model::{CommandRow, CommandStatus};
use crate::sandbox::Executor;
use crate::signing::Verifier;

/// What one poll cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub conflicts: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// The kill switch stopped intake at some point during the cycle.
    pub halted_by_kill_switch: bool,
}

/// The worker runtime: polls, claims, verifies, executes and records.
///
/// Commands are processed one at a time, in `created_at` order. A
/// command that has been claimed always runs to a terminal state, even
/// if the kill switch is engaged while it executes.
pub struct Worker {
    config: Arc<Config>,
    lifecycle: Lifecycle,
    gate: GovernanceGate,
    verifier: Verifier,
    executor: Executor,
}

impl Worker {
    pub fn new(config: Arc<Config>, backend: Arc<dyn Backend>) -> Result<Self> {
        let verifier = Verifier::new(&config.signing.secret, config.signing.resolved_schemes()?);
        let lifecycle = Lifecycle::new(
            backend.clone(),
            config.worker.project_id.clone(),
            config.worker.node_id.clone(),
        );
        let gate = GovernanceGate::new(backend, config.worker.project_id.clone());
        let executor = Executor::new(&config);

        Ok(Self {
            config,
            lifecycle,
            gate,
            verifier,
            executor,
        })
    }

    /// Polls until `shutdown` is cancelled.
    ///
    /// Cancellation is observed between cycles and during the sleep; a
    /// command already executing is allowed to finish.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut backoff = Backoff::new(
            self.config.worker.poll_interval(),
            self.config.worker.max_backoff(),
        );

        info!(
            "Worker {} polling project {} every {}ms",
            self.config.worker.node_id,
            self.config.worker.project_id,
            self.config.worker.poll_interval_ms
        );

        while !shutdown.is_cancelled() {
            let delay = match self.poll_once(&shutdown).await {
                Ok(report) => {
                    if report.claimed > 0 || report.conflicts > 0 {
                        debug!("Poll cycle: {report:?}");
                    }
                    backoff.on_success()
                }
                Err(e) => {
                    let delay = backoff.on_failure();
                    warn!(
                        "Poll cycle failed ({} in a row): {e:#}, retrying in {}ms",
                        backoff.failures,
                        delay.as_millis()
                    );
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => {}
            }
        }

        info!("Shutdown requested, worker stopped");
        Ok(())
    }

    /// One sequential cycle: gate, list, then claim and run each row.
    ///
    /// Every row claimed here reaches a terminal state before the next
    /// row is considered, unless `shutdown` fires while the store is
    /// refusing the terminal update.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let controls = self.gate.fetch_controls().await?;
        if !controls.admit_dequeue() {
            debug!("Kill switch engaged, not dequeuing");
            report.halted_by_kill_switch = true;
            return Ok(report);
        }

        let rows = self.lifecycle.list_eligible(self.config.worker.batch_size).await?;
        if rows.is_empty() {
            return Ok(report);
        }
        debug!("{} eligible command(s)", rows.len());

        for row in rows {
            // Controls may change while earlier commands run
            if !self.gate.read_controls().await.admit_dequeue() {
                warn!("Kill switch engaged, leaving remaining commands queued");
                report.halted_by_kill_switch = true;
                break;
            }

            match self.lifecycle.claim(&row).await? {
                ClaimOutcome::Conflict => {
                    report.conflicts += 1;
                    continue;
                }
                ClaimOutcome::Claimed => report.claimed += 1,
            }

            let outcome = self.run_claimed(&row).await;
            self.settle(&row, &outcome, shutdown).await?;
            match outcome {
                Ok(_) => report.done += 1,
                Err(e) => match e.terminal_status() {
                    CommandStatus::Cancelled => report.cancelled += 1,
                    _ => report.failed += 1,
                },
            }
        }

        Ok(report)
    }

    /// Verifies and executes a row this worker has claimed.
    ///
    /// Controls are read again after the claim: the kill switch and the
    /// capability flags are taken from this read, not from the one that
    /// admitted the claim.
    async fn run_claimed(&self, row: &CommandRow) -> Result<Value, CommandError> {
        let envelope = row.envelope();
        match self.verifier.matching_scheme(&envelope, row.signature.as_deref()) {
            Some(scheme) => debug!("Command {} signature verified ({scheme})", row.id),
            None => {
                error!(
                    target: "security",
                    "Rejected command {} ({}): invalid or missing signature",
                    row.id, row.command
                );
                return Err(CommandError::SignatureInvalid);
            }
        }

        let controls = self.gate.read_controls().await;
        if !controls.admit_dequeue() {
            warn!("Kill switch engaged after claiming {}, not dispatching", row.id);
            return Err(CommandError::GovernanceBlocked(
                "kill switch engaged before dispatch".to_string(),
            ));
        }

        let result = self
            .executor
            .dispatch(&row.command, row.payload.as_ref(), &controls)
            .await;
        if let Err(e) = &result {
            if e.is_security_event() {
                error!(target: "security", "Command {} ({}): {e}", row.id, row.command);
            }
        }
        result
    }

    /// Records the terminal state of a claimed row, retrying store
    /// failures with backoff until the update lands or shutdown fires.
    async fn settle(
        &self,
        row: &CommandRow,
        outcome: &Result<Value, CommandError>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut backoff = Backoff::new(
            self.config.worker.poll_interval(),
            self.config.worker.max_backoff(),
        );

        loop {
            let attempt = match outcome {
                Ok(result) => self.lifecycle.finish_ok(row, result.clone()).await,
                Err(e) => self.lifecycle.reject(row, e).await,
            };
            let e = match attempt {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if shutdown.is_cancelled() {
                return Err(e.context(format!(
                    "shutting down with command {} still running",
                    row.id
                )));
            }
            let delay = backoff.on_failure();
            warn!(
                "Cannot record outcome of command {} (attempt {}): {e:#}, retrying in {}ms",
                row.id,
                backoff.failures,
                delay.as_millis()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::config::tests::config_for_root;
    use crate::lifecycle::tests::queued;
    use crate::model::{ControlsRow, EventLevel};
    use serde_json::{json, Value};
    use std::time::Duration;

    const SECRET: &str = "s3cr3t";

    fn controls(kill: bool, shell: bool, write: bool) -> ControlsRow {
        ControlsRow {
            kill_switch: Some(kill),
            allow_shell: Some(shell),
            allow_write: Some(write),
            allow_fs: None,
        }
    }

    fn signed(id: &str, command: &str, payload: Value, created_at: &str) -> CommandRow {
        let mut row = queued(id, command, created_at);
        row.payload = Some(payload);
        let signature = crate::signing::sign(SECRET, &row.envelope());
        row.signature = Some(signature);
        row
    }

    fn setup() -> (tempfile::TempDir, Arc<MemoryBackend>, Worker) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        backend.set_controls(Some(controls(false, true, true)));
        let config = Arc::new(config_for_root(dir.path()));
        let worker = Worker::new(config, backend.clone()).unwrap();
        (dir, backend, worker)
    }

    fn event_types(backend: &MemoryBackend) -> Vec<String> {
        backend.events().into_iter().map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn test_signed_ping_completes() {
        let (_dir, backend, worker) = setup();
        backend.insert_command(signed("c1", "ping", json!({}), "2024-01-01T00:00:00Z"));

        let report = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.done, 1);

        let row = backend.command("c1").unwrap();
        assert_eq!(row.status, CommandStatus::Done);
        assert_eq!(row.result.unwrap()["pong"], true);
        assert!(row.started_at.is_some());
        assert!(row.finished_at.is_some());
        assert_eq!(event_types(&backend), vec!["command.started", "command.done"]);
    }

    #[tokio::test]
    async fn test_tampered_payload_is_cancelled() {
        let (dir, backend, worker) = setup();
        let mut row = signed(
            "c2",
            "fs.write",
            json!({"path": "a.txt", "content": "hello"}),
            "2024-01-01T00:00:00Z",
        );
        row.payload = Some(json!({"path": "a.txt", "content": "evil"}));
        backend.insert_command(row);

        let report = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.cancelled, 1);

        let row = backend.command("c2").unwrap();
        assert_eq!(row.status, CommandStatus::Cancelled);
        assert!(row.result.is_none());
        assert!(!dir.path().join("a.txt").exists());

        let events = backend.events();
        assert_eq!(events[1].event_type, "command.cancelled");
        assert_eq!(events[1].level, EventLevel::Error);
    }

    #[tokio::test]
    async fn test_unsigned_command_is_cancelled() {
        let (_dir, backend, worker) = setup();
        backend.insert_command(queued("c1", "ping", "2024-01-01T00:00:00Z"));
        worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(backend.command("c1").unwrap().status, CommandStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_not_allowlisted_program_fails() {
        let (_dir, backend, worker) = setup();
        backend.insert_command(signed(
            "c3",
            "shell.exec",
            json!({"cmd": "rm", "args": ["-rf", "/"]}),
            "2024-01-01T00:00:00Z",
        ));

        let report = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed, 1);
        let row = backend.command("c3").unwrap();
        assert_eq!(row.status, CommandStatus::Failed);
        assert!(row.error.unwrap().contains("rm"));
    }

    #[tokio::test]
    async fn test_path_traversal_fails() {
        let (_dir, backend, worker) = setup();
        backend.insert_command(signed(
            "c1",
            "read_dir",
            json!({"path": "../../etc"}),
            "2024-01-01T00:00:00Z",
        ));
        worker.poll_once(&CancellationToken::new()).await.unwrap();
        let row = backend.command("c1").unwrap();
        assert_eq!(row.status, CommandStatus::Failed);
        assert!(row.result.is_none());
    }

    #[tokio::test]
    async fn test_capability_checked_at_dispatch() {
        let (dir, backend, worker) = setup();
        backend.set_controls(Some(controls(false, false, false)));
        backend.insert_command(signed(
            "c1",
            "fs.write",
            json!({"path": "a.txt", "content": "x"}),
            "2024-01-01T00:00:00Z",
        ));
        worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(backend.command("c1").unwrap().status, CommandStatus::Cancelled);
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_kill_switch_blocks_intake() {
        let (_dir, backend, worker) = setup();
        backend.set_controls(Some(controls(true, true, true)));
        backend.insert_command(signed("c1", "ping", json!({}), "2024-01-01T00:00:00Z"));

        let report = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert!(report.halted_by_kill_switch);
        assert_eq!(report.claimed, 0);
        assert_eq!(backend.command("c1").unwrap().status, CommandStatus::Queued);
        assert!(backend.events().is_empty());
    }

    #[tokio::test]
    async fn test_missing_controls_row_blocks_intake() {
        let (_dir, backend, worker) = setup();
        backend.set_controls(None);
        backend.insert_command(signed("c1", "ping", json!({}), "2024-01-01T00:00:00Z"));
        let report = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert!(report.halted_by_kill_switch);
        assert_eq!(backend.command("c1").unwrap().status, CommandStatus::Queued);
    }

    #[tokio::test]
    async fn test_kill_switch_mid_batch_lets_running_command_finish() {
        let (_dir, backend, worker) = setup();
        backend.insert_command(signed(
            "c1",
            "shell.exec",
            json!({"cmd": "sleep", "args": ["0.5"]}),
            "2024-01-01T00:00:00Z",
        ));
        backend.insert_command(signed("c4", "ping", json!({}), "2024-01-01T00:00:01Z"));

        let flipper = {
            let backend = backend.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                backend.set_controls(Some(controls(true, true, true)));
            })
        };

        let report = worker.poll_once(&CancellationToken::new()).await.unwrap();
        flipper.await.unwrap();

        assert_eq!(report.done, 1);
        assert!(report.halted_by_kill_switch);
        assert_eq!(backend.command("c1").unwrap().status, CommandStatus::Done);
        assert_eq!(backend.command("c4").unwrap().status, CommandStatus::Queued);
    }

    #[tokio::test]
    async fn test_processes_in_created_at_order() {
        let (_dir, backend, worker) = setup();
        backend.insert_command(signed("late", "ping", json!({}), "2024-01-01T00:00:02Z"));
        backend.insert_command(signed("early", "ping", json!({}), "2024-01-01T00:00:01Z"));

        let report = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.done, 2);
        let started: Vec<String> = backend
            .events()
            .into_iter()
            .filter(|e| e.event_type == "command.started")
            .map(|e| e.data.unwrap()["command_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(started, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn test_pending_approval_is_ignored() {
        let (_dir, backend, worker) = setup();
        let mut row = signed("c1", "ping", json!({}), "2024-01-01T00:00:00Z");
        row.needs_approval = true;
        backend.insert_command(row);
        let report = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(backend.command("c1").unwrap().status, CommandStatus::Queued);
    }

    #[tokio::test]
    async fn test_backend_failure_is_an_error() {
        let (_dir, backend, worker) = setup();
        backend.set_fail_reads(true);
        assert!(worker.poll_once(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_event_failure_does_not_block_transition() {
        let (_dir, backend, worker) = setup();
        backend.set_fail_events(true);
        backend.insert_command(signed("c1", "ping", json!({}), "2024-01-01T00:00:00Z"));
        let report = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.done, 1);
        assert_eq!(backend.command("c1").unwrap().status, CommandStatus::Done);
    }

    #[tokio::test]
    async fn test_concurrent_workers_run_each_command_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        backend.set_controls(Some(controls(false, true, true)));
        for i in 0..5 {
            backend.insert_command(signed(
                &format!("c{i}"),
                "ping",
                json!({}),
                &format!("2024-01-01T00:00:0{i}Z"),
            ));
        }
        let config = Arc::new(config_for_root(dir.path()));
        let a = Worker::new(config.clone(), backend.clone()).unwrap();
        let b = Worker::new(config, backend.clone()).unwrap();

        let shutdown = CancellationToken::new();
        let (ra, rb) = tokio::join!(a.poll_once(&shutdown), b.poll_once(&shutdown));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.claimed + rb.claimed, 5);
        assert_eq!(ra.done + rb.done, 5);

        let started = event_types(&backend)
            .into_iter()
            .filter(|t| t == "command.started")
            .count();
        assert_eq!(started, 5);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_dir, backend, worker) = setup();
        backend.insert_command(signed("c1", "ping", json!({}), "2024-01-01T00:00:00Z"));

        let shutdown = CancellationToken::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(backend.command("c1").unwrap().status, CommandStatus::Done);
    }

    #[tokio::test]
    async fn test_run_survives_backend_outage() {
        let (_dir, backend, worker) = setup();
        backend.set_fail_reads(true);
        backend.insert_command(signed("c1", "ping", json!({}), "2024-01-01T00:00:00Z"));

        let shutdown = CancellationToken::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        backend.set_fail_reads(false);
        // Backoff is capped at 1s by config_for_root
        tokio::time::sleep(Duration::from_millis(1500)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(backend.command("c1").unwrap().status, CommandStatus::Done);
    }

    #[tokio::test]
    async fn test_transient_update_failure_still_reaches_terminal_state() {
        let (_dir, backend, worker) = setup();
        backend.insert_command(signed("c1", "ping", json!({}), "2024-01-01T00:00:00Z"));
        backend.insert_command(signed("c2", "ping", json!({}), "2024-01-01T00:00:01Z"));
        backend.fail_terminal_updates(2);

        let report = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.done, 2);
        assert_eq!(backend.command("c1").unwrap().status, CommandStatus::Done);
        assert_eq!(backend.command("c2").unwrap().status, CommandStatus::Done);
        assert_eq!(
            event_types(&backend),
            vec!["command.started", "command.done", "command.started", "command.done"]
        );
    }

    #[tokio::test]
    async fn test_rejection_is_retried_until_recorded() {
        let (_dir, backend, worker) = setup();
        backend.insert_command(queued("c1", "ping", "2024-01-01T00:00:00Z"));
        backend.fail_terminal_updates(1);

        let report = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(backend.command("c1").unwrap().status, CommandStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_shutdown_stops_outcome_retries() {
        let (_dir, backend, worker) = setup();
        backend.insert_command(signed("c1", "ping", json!({}), "2024-01-01T00:00:00Z"));
        backend.fail_terminal_updates(u32::MAX);

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(worker.poll_once(&shutdown).await.is_err());
        assert_eq!(backend.command("c1").unwrap().status, CommandStatus::Running);
    }

    #[tokio::test]
    async fn test_write_revoked_between_claim_and_dispatch() {
        let (dir, backend, worker) = setup();
        backend.insert_command(signed(
            "c1",
            "fs.write",
            json!({"path": "a.txt", "content": "x"}),
            "2024-01-01T00:00:00Z",
        ));
        backend.set_controls_after_claim(controls(false, true, false));

        let report = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(backend.command("c1").unwrap().status, CommandStatus::Cancelled);
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_kill_switch_between_claim_and_dispatch() {
        let (dir, backend, worker) = setup();
        backend.insert_command(signed(
            "c1",
            "fs.write",
            json!({"path": "a.txt", "content": "x"}),
            "2024-01-01T00:00:00Z",
        ));
        backend.insert_command(signed("c2", "ping", json!({}), "2024-01-01T00:00:01Z"));
        backend.set_controls_after_claim(controls(true, true, true));

        let report = worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.cancelled, 1);
        assert!(report.halted_by_kill_switch);
        let row = backend.command("c1").unwrap();
        assert_eq!(row.status, CommandStatus::Cancelled);
        assert!(row.error.unwrap().contains("kill switch"));
        assert!(!dir.path().join("a.txt").exists());
        assert_eq!(backend.command("c2").unwrap().status, CommandStatus::Queued);
    }
}
