//! `ping` and `status`: side-effect-free liveness payloads.
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::governance::Controls;

/// Who is answering.
#[derive(Debug, Clone)]
pub struct Identity {
    pub project_id: String,
    pub node_id: String,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| std::fs::read_to_string("/etc/hostname"))
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// 1, 5 and 15 minute load averages, where the platform exposes them.
fn load_average() -> Option<[f64; 3]> {
    let text = std::fs::read_to_string("/proc/loadavg").ok()?;
    parse_loadavg(&text)
}

fn parse_loadavg(text: &str) -> Option<[f64; 3]> {
    let mut fields = text.split_whitespace().map(|f| f.parse::<f64>().ok());
    Some([fields.next()??, fields.next()??, fields.next()??])
}

pub fn ping(identity: &Identity) -> Value {
    json!({
        "pong": true,
        "time": now(),
        "project_id": identity.project_id,
        "node_id": identity.node_id,
        "version": env!("CARGO_PKG_VERSION"),
    })
}

pub fn status(
    identity: &Identity,
    uptime: Duration,
    sandbox_root: &str,
    controls: &Controls,
    shell_allowlist: &[String],
) -> Value {
    json!({
        "time": now(),
        "project_id": identity.project_id,
        "node_id": identity.node_id,
        "version": env!("CARGO_PKG_VERSION"),
        "host": {
            "hostname": hostname(),
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "pid": std::process::id(),
            "load_average": load_average(),
        },
        "uptime_secs": uptime.as_secs(),
        "sandbox_root": sandbox_root,
        "capabilities": {
            "allow_shell": controls.allow_shell,
            "allow_write": controls.allow_write,
        },
        "shell_allowlist": shell_allowlist,
    })
}
