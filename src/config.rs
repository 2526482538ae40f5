use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;

use crate::signing::SignatureScheme;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub worker: WorkerConfig,
    pub signing: SigningConfig,
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub shell: ShellConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Base URL of the table store, e.g. "https://db.example.com"
    pub url: String,
    /// Supports ${ENV_VAR} substitution
    pub api_key: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    pub project_id: String,
    /// Identity matched against `commands.node_id`
    pub node_id: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Ceiling for the retry delay after consecutive backend failures
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SigningConfig {
    /// Supports ${ENV_VAR} substitution
    pub secret: String,
    /// Accepted schemes, highest priority first
    #[serde(default = "default_schemes")]
    pub schemes: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Canonicalized by `Config::validate`
    pub root: PathBuf,
    #[serde(default = "default_file_head_cap")]
    pub file_head_cap: usize,
    #[serde(default = "default_max_dir_entries")]
    pub max_dir_entries: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShellConfig {
    /// Exact program names, or `prefix*` patterns
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default = "default_shell_timeout")]
    pub timeout_secs: u64,
    /// Per-stream capture ceiling in bytes
    #[serde(default = "default_output_cap")]
    pub output_cap: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            timeout_secs: default_shell_timeout(),
            output_cap: default_output_cap(),
        }
    }
}

fn default_request_timeout() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_batch_size() -> usize {
    10
}

fn default_max_backoff() -> u64 {
    60
}

fn default_schemes() -> Vec<String> {
    vec!["v2".to_string(), "v2-b64".to_string(), "v1".to_string()]
}

fn default_file_head_cap() -> usize {
    64 * 1024
}

fn default_max_dir_entries() -> usize {
    500
}

fn default_shell_timeout() -> u64 {
    30
}

fn default_output_cap() -> usize {
    64 * 1024
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

impl ShellConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SigningConfig {
    /// Resolves scheme names in configured priority order.
    pub fn resolved_schemes(&self) -> Result<Vec<SignatureScheme>> {
        self.schemes
            .iter()
            .map(|name| {
                SignatureScheme::by_name(name)
                    .ok_or_else(|| anyhow!("Unknown signing scheme '{name}'"))
            })
            .collect()
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Cannot read config {path}: {e}"))?;
        Self::from_toml(&content)
    }

    /// Parses and validates a config document.
    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand environment variables like ${WARDEN_SIGNING_SECRET}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()
    }

    /// Checks every option and canonicalizes the sandbox root.
    pub fn validate(mut self) -> Result<Self> {
        if self.signing.secret.trim().is_empty() {
            bail!("signing.secret must not be empty");
        }
        if self.signing.schemes.is_empty() {
            bail!("signing.schemes must list at least one scheme");
        }
        self.signing.resolved_schemes()?;

        if self.worker.project_id.trim().is_empty() || self.worker.node_id.trim().is_empty() {
            bail!("worker.project_id and worker.node_id are required");
        }
        if self.worker.poll_interval_ms == 0 {
            bail!("worker.poll_interval_ms must be positive");
        }
        if self.worker.batch_size == 0 {
            bail!("worker.batch_size must be positive");
        }
        if self.worker.max_backoff_secs == 0 {
            bail!("worker.max_backoff_secs must be positive");
        }
        if self.backend.request_timeout_secs == 0 {
            bail!("backend.request_timeout_secs must be positive");
        }

        if self.sandbox.file_head_cap == 0 || self.sandbox.max_dir_entries == 0 {
            bail!("sandbox.file_head_cap and sandbox.max_dir_entries must be positive");
        }
        self.sandbox.root = canonical_root(&self.sandbox.root)?;

        if self.shell.timeout_secs == 0 || self.shell.output_cap == 0 {
            bail!("shell.timeout_secs and shell.output_cap must be positive");
        }
        if let Some(bad) = self
            .shell
            .allowlist
            .iter()
            .find(|entry| entry.trim().is_empty() || entry.trim() == "*")
        {
            bail!("shell.allowlist entry '{bad}' is not a usable program name");
        }

        Ok(self)
    }
}

fn canonical_root(root: &Path) -> Result<PathBuf> {
    if !root.is_absolute() {
        bail!("sandbox.root must be an absolute path (got {})", root.display());
    }
    let canonical = std::fs::canonicalize(root)
        .map_err(|e| anyhow!("sandbox.root {}: {e}", root.display()))?;
    if !canonical.is_dir() {
        bail!("sandbox.root {} is not a directory", canonical.display());
    }
    Ok(canonical)
}
