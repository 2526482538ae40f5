//! Sandboxed executor.
//!
//! The command vocabulary is closed: a command name either parses into a
//! `CommandKind` or is rejected with `CommandNotAllowed` before anything
//! runs. Capabilities are re-checked here at dispatch time, independent
//! of the dequeue-time check, because controls may change in between.
//!
//! The security model is layered:
//!
//! 1. Signature: only commands signed by the issuer reach the executor
//! 2. Governance: `allow_write` / `allow_shell` gate side effects
//! 3. Path confinement: every filesystem path resolves under the root,
//!    with symbolic links refused
//! 4. Shell allowlist: a second, independent gate on subprocess names
//! 5. Resource bounds: byte caps on reads and captured output, a hard
//!    wall-clock timeout on subprocesses
pub mod fs;
pub mod introspect;
pub mod paths;
pub mod shell;

use std::path::PathBuf;
use std::time::Instant;

use base64::Engine;
use serde::Deserialize;
use serde_json::Value;

use crate::config::Config;
use crate::error::CommandError;
use crate::governance::Controls;
use introspect::Identity;
use shell::{ShellInvocation, ShellRunner};

/// Every command the worker understands.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Ping,
    Status,
    ReadDir { path: String, limit: Option<usize> },
    ReadFileHead { path: String, max_bytes: Option<usize> },
    FsWrite { path: String, content: Vec<u8> },
    ShellExec { invocation: ShellInvocation, timeout_ms: Option<u64> },
}

#[derive(Deserialize)]
struct ReadDirParams {
    #[serde(default = "default_dir")]
    path: String,
    #[serde(default)]
    limit: Option<usize>,
}

fn default_dir() -> String {
    ".".to_string()
}

#[derive(Deserialize)]
struct ReadFileHeadParams {
    path: String,
    #[serde(default, alias = "maxBytes")]
    max_bytes: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum ContentEncoding {
    #[serde(alias = "utf-8")]
    Utf8,
    Base64,
}

#[derive(Deserialize)]
struct FsWriteParams {
    path: String,
    content: String,
    #[serde(default)]
    encoding: Option<ContentEncoding>,
}

#[derive(Deserialize)]
struct ShellExecParams {
    #[serde(default, alias = "command")]
    cmd: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn params<T: for<'de> Deserialize<'de>>(name: &str, payload: Option<&Value>) -> Result<T, CommandError> {
    let value = match payload {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(v) => v.clone(),
    };
    serde_json::from_value(value).map_err(|e| CommandError::InvalidPayload(format!("{name}: {e}")))
}

impl CommandKind {
    /// Parses a command name and its payload.
    pub fn parse(name: &str, payload: Option<&Value>) -> Result<Self, CommandError> {
        match name {
            "ping" => Ok(CommandKind::Ping),
            "status" => Ok(CommandKind::Status),
            "read_dir" => {
                let p: ReadDirParams = params(name, payload)?;
                Ok(CommandKind::ReadDir {
                    path: p.path,
                    limit: p.limit,
                })
            }
            "read_file_head" => {
                let p: ReadFileHeadParams = params(name, payload)?;
                Ok(CommandKind::ReadFileHead {
                    path: p.path,
                    max_bytes: p.max_bytes,
                })
            }
            "fs.write" => {
                let p: FsWriteParams = params(name, payload)?;
                let content = match p.encoding.unwrap_or(ContentEncoding::Utf8) {
                    ContentEncoding::Utf8 => p.content.into_bytes(),
                    ContentEncoding::Base64 => base64::engine::general_purpose::STANDARD
                        .decode(p.content.trim())
                        .map_err(|e| CommandError::InvalidPayload(format!("fs.write: bad base64: {e}")))?,
                };
                Ok(CommandKind::FsWrite {
                    path: p.path,
                    content,
                })
            }
            "shell.exec" => {
                let p: ShellExecParams = params(name, payload)?;
                let invocation = match (p.cmd, p.script) {
                    (Some(cmd), None) => ShellInvocation::Program { cmd, args: p.args },
                    (None, Some(script)) => ShellInvocation::Script(script),
                    _ => {
                        return Err(CommandError::InvalidPayload(
                            "shell.exec: exactly one of cmd or script is required".to_string(),
                        ))
                    }
                };
                Ok(CommandKind::ShellExec {
                    invocation,
                    timeout_ms: p.timeout_ms,
                })
            }
            other => Err(CommandError::CommandNotAllowed(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Ping => "ping",
            CommandKind::Status => "status",
            CommandKind::ReadDir { .. } => "read_dir",
            CommandKind::ReadFileHead { .. } => "read_file_head",
            CommandKind::FsWrite { .. } => "fs.write",
            CommandKind::ShellExec { .. } => "shell.exec",
        }
    }
}

/// Executes parsed commands under the configured bounds.
pub struct Executor {
    identity: Identity,
    root: PathBuf,
    file_head_cap: usize,
    max_dir_entries: usize,
    shell: ShellRunner,
    started: Instant,
}

impl Executor {
    pub fn new(config: &Config) -> Self {
        Self {
            identity: Identity {
                project_id: config.worker.project_id.clone(),
                node_id: config.worker.node_id.clone(),
            },
            root: config.sandbox.root.clone(),
            file_head_cap: config.sandbox.file_head_cap,
            max_dir_entries: config.sandbox.max_dir_entries,
            shell: ShellRunner::new(&config.shell, config.sandbox.root.clone()),
            started: Instant::now(),
        }
    }

    /// Parses and runs a command by name.
    pub async fn dispatch(&self, name: &str, payload: Option<&Value>, controls: &Controls) -> Result<Value, CommandError> {
        let kind = CommandKind::parse(name, payload)?;
        self.execute(kind, controls).await
    }

    pub async fn execute(&self, kind: CommandKind, controls: &Controls) -> Result<Value, CommandError> {
        match kind {
            CommandKind::Ping => Ok(introspect::ping(&self.identity)),
            CommandKind::Status => Ok(introspect::status(
                &self.identity,
                self.started.elapsed(),
                &self.root.display().to_string(),
                controls,
                self.shell.allowlist(),
            )),
            CommandKind::ReadDir { path, limit } => {
                let limit = limit.unwrap_or(self.max_dir_entries).min(self.max_dir_entries);
                fs::read_dir(&self.root, &path, limit).await
            }
            CommandKind::ReadFileHead { path, max_bytes } => {
                fs::read_file_head(&self.root, &path, max_bytes, self.file_head_cap).await
            }
            CommandKind::FsWrite { path, content } => {
                controls.require_write()?;
                fs::write_file(&self.root, &path, &content).await
            }
            CommandKind::ShellExec { invocation, timeout_ms } => {
                controls.require_shell()?;
                self.shell.run(&invocation, timeout_ms).await
            }
        }
    }
}
