//! Allowlisted subprocess execution with a hard timeout and capped capture.
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ShellConfig;
use crate::error::CommandError;

/// Characters that would let a script run more than its leading word.
const SCRIPT_OPERATORS: [&str; 9] = [";", "&", "|", "`", "$(", ">", "<", "\n", "\r"];

/// How a `shell.exec` payload asks to run something.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellInvocation {
    /// Program plus literal arguments, no shell involved.
    Program { cmd: String, args: Vec<String> },
    /// Free-form text run by `sh -c`; only its leading word is allowlisted.
    Script(String),
}

impl ShellInvocation {
    /// The token checked against the allowlist.
    pub fn leading_token(&self) -> Result<&str, CommandError> {
        match self {
            ShellInvocation::Program { cmd, .. } => {
                let cmd = cmd.trim();
                if cmd.is_empty() {
                    return Err(CommandError::InvalidPayload("empty cmd".to_string()));
                }
                Ok(cmd)
            }
            ShellInvocation::Script(script) => {
                if let Some(op) = SCRIPT_OPERATORS.iter().find(|op| script.contains(*op)) {
                    return Err(CommandError::CommandNotAllowed(format!(
                        "script uses shell operator {op:?}"
                    )));
                }
                script
                    .split_whitespace()
                    .next()
                    .ok_or_else(|| CommandError::InvalidPayload("empty script".to_string()))
            }
        }
    }
}

/// Exact names, or `prefix*` patterns. Patterns only match bare names.
pub fn is_allowlisted(allowlist: &[String], token: &str) -> bool {
    allowlist.iter().any(|entry| {
        let entry = entry.trim();
        match entry.strip_suffix('*') {
            Some(prefix) => !token.contains('/') && token.starts_with(prefix),
            None => entry == token,
        }
    })
}

/// Bytes captured from one stream.
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Reads a stream to EOF, keeping at most `cap` bytes.
///
/// The remainder is drained and dropped so the child never blocks on a
/// full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> std::io::Result<Captured> {
    let mut bytes = Vec::with_capacity(cap.min(8192));
    let mut chunk = [0u8; 8192];
    let mut total = 0usize;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        total = total.saturating_add(n);
        let room = cap.saturating_sub(bytes.len());
        bytes.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok(Captured {
        bytes,
        truncated: total > cap,
    })
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // The child leads its own group (process_group(0)), so pgid == pid
    #[allow(unsafe_code)]
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        debug!(
            "killpg({pid}) failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// The worker's `PATH` with relative and empty entries dropped, so a bare
/// program name never resolves inside the sandbox root.
fn child_path(inherited: Option<OsString>) -> OsString {
    let absolute: Vec<PathBuf> = inherited
        .as_deref()
        .map(|raw| std::env::split_paths(raw).filter(|p| p.is_absolute()).collect())
        .unwrap_or_default();
    if absolute.is_empty() {
        return OsString::from(DEFAULT_PATH);
    }
    std::env::join_paths(absolute).unwrap_or_else(|_| OsString::from(DEFAULT_PATH))
}

/// Runs allowlisted subprocesses inside the sandbox root.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    allowlist: Vec<String>,
    timeout: Duration,
    output_cap: usize,
    cwd: PathBuf,
}

impl ShellRunner {
    pub fn new(config: &ShellConfig, cwd: PathBuf) -> Self {
        Self {
            allowlist: config.allowlist.clone(),
            timeout: config.timeout(),
            output_cap: config.output_cap,
            cwd,
        }
    }

    pub fn allowlist(&self) -> &[String] {
        &self.allowlist
    }

    /// Effective timeout: the request may shorten the configured one, never extend it.
    fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            Some(ms) if ms > 0 => self.timeout.min(Duration::from_millis(ms)),
            _ => self.timeout,
        }
    }

    fn build_command(&self, invocation: &ShellInvocation) -> Command {
        let mut command = match invocation {
            ShellInvocation::Program { cmd, args } => {
                let mut c = std::process::Command::new(cmd.trim());
                c.args(args);
                c
            }
            ShellInvocation::Script(script) => {
                let mut c = std::process::Command::new("sh");
                c.arg("-c").arg(script);
                c
            }
        };

        let path = child_path(std::env::var_os("PATH"));
        command
            .current_dir(&self.cwd)
            .env_clear()
            .env("PATH", path)
            .env("HOME", &self.cwd)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a timeout can kill grandchildren too
            command.process_group(0);
        }

        let mut command = Command::from(command);
        command.kill_on_drop(true);
        command
    }

    /// Checks the allowlist, spawns, and waits under the timeout.
    pub async fn run(&self, invocation: &ShellInvocation, timeout_ms: Option<u64>) -> Result<Value, CommandError> {
        let token = invocation.leading_token()?;
        if !is_allowlisted(&self.allowlist, token) {
            return Err(CommandError::CommandNotAllowed(token.to_string()));
        }

        let limit = self.effective_timeout(timeout_ms);
        let started = Instant::now();
        let mut child = self
            .build_command(invocation)
            .spawn()
            .map_err(|e| CommandError::ExecutionFailed(format!("cannot spawn {token}: {e}")))?;
        let pid = child.id();
        info!("Spawned {token} (pid {pid:?}, timeout {}ms)", limit.as_millis());

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill().await;
            return Err(CommandError::ExecutionFailed("stdio not captured".to_string()));
        };

        let cap = self.output_cap;
        let outcome = tokio::time::timeout(limit, async {
            tokio::join!(read_capped(stdout, cap), read_capped(stderr, cap), child.wait())
        })
        .await;

        let (stdout, stderr, status) = match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!("{token} exceeded {}ms, killing process group", limit.as_millis());
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                let _ = child.kill().await;
                return Err(CommandError::ExecutionTimeout {
                    timeout_ms: limit.as_millis() as u64,
                });
            }
        };
        let stdout = stdout?;
        let stderr = stderr?;
        let status = status?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let stdout_text = String::from_utf8_lossy(&stdout.bytes).into_owned();
        let stderr_text = String::from_utf8_lossy(&stderr.bytes).into_owned();

        if !status.success() {
            let code = status
                .code()
                .map(|c| format!("exit code {c}"))
                .unwrap_or_else(|| "terminated by signal".to_string());
            let detail = stderr_text.trim();
            return Err(CommandError::ExecutionFailed(if detail.is_empty() {
                format!("{token}: {code}")
            } else {
                format!("{token}: {code}: {detail}")
            }));
        }

        Ok(json!({
            "exit_code": status.code(),
            "timed_out": false,
            "stdout": stdout_text,
            "stderr": stderr_text,
            "stdout_truncated": stdout.truncated,
            "stderr_truncated": stderr.truncated,
            "duration_ms": duration_ms,
        }))
    }
}
