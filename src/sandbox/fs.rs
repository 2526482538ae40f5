//! Confined filesystem commands: `read_dir`, `read_file_head`, `fs.write`.
//!
//! All I/O uses `tokio::fs` so a slow disk does not stall the poll loop.
use std::collections::BTreeSet;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::paths::{display_relative, resolve_existing, resolve_for_write};
use crate::error::CommandError;

fn kind_of(file_type: &std::fs::FileType) -> &'static str {
    if file_type.is_file() {
        "file"
    } else if file_type.is_dir() {
        "directory"
    } else {
        "other"
    }
}

fn format_mtime(modified: SystemTime) -> String {
    DateTime::<Utc>::from(modified).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Lists the immediate children of a directory, at most `limit` entries.
pub async fn read_dir(root: &Path, requested: &str, limit: usize) -> Result<Value, CommandError> {
    let dir = resolve_existing(root, requested).await?;
    let meta = tokio::fs::metadata(&dir).await?;
    if !meta.is_dir() {
        return Err(CommandError::ExecutionFailed(format!("{requested}: not a directory")));
    }

    // Only the `limit` smallest names are kept, in name order
    let mut reader = tokio::fs::read_dir(&dir).await?;
    let mut names = BTreeSet::new();
    let mut truncated = false;
    while let Some(entry) = reader.next_entry().await? {
        names.insert(entry.file_name());
        if names.len() > limit {
            names.pop_last();
            truncated = true;
        }
    }

    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        // symlink_metadata: links are reported as "other", never followed
        let (kind, size, modified) = match tokio::fs::symlink_metadata(dir.join(&name)).await {
            Ok(meta) => (
                kind_of(&meta.file_type()),
                meta.is_file().then(|| meta.len()),
                meta.modified().ok().map(format_mtime),
            ),
            Err(_) => ("other", None, None),
        };
        entries.push(json!({
            "name": name.to_string_lossy(),
            "kind": kind,
            "size": size,
            "modified": modified,
        }));
    }

    debug!("read_dir {} → {} entries", dir.display(), entries.len());
    Ok(json!({
        "path": display_relative(root, &dir),
        "entries": entries,
        "truncated": truncated,
    }))
}

/// Reads at most `min(max_bytes, cap, file size)` bytes from the start of a file.
pub async fn read_file_head(
    root: &Path,
    requested: &str,
    max_bytes: Option<usize>,
    cap: usize,
) -> Result<Value, CommandError> {
    let path = resolve_existing(root, requested).await?;
    let meta = tokio::fs::symlink_metadata(&path).await?;
    if !meta.is_file() {
        return Err(CommandError::ExecutionFailed(format!("{requested}: not a regular file")));
    }

    let size = meta.len();
    let wanted = max_bytes.unwrap_or(cap).min(cap) as u64;
    let limit = wanted.min(size);

    let file = tokio::fs::File::open(&path).await?;
    let mut buf = Vec::with_capacity(limit as usize);
    file.take(limit).read_to_end(&mut buf).await?;

    let utf8 = std::str::from_utf8(&buf).is_ok();
    Ok(json!({
        "path": display_relative(root, &path),
        "size": size,
        "bytes": buf.len(),
        "truncated": (buf.len() as u64) < size,
        "utf8": utf8,
        "text": String::from_utf8_lossy(&buf),
    }))
}

/// Writes `content`, creating parent directories, via a temp file + rename.
pub async fn write_file(root: &Path, requested: &str, content: &[u8]) -> Result<Value, CommandError> {
    let target = resolve_for_write(root, requested).await?;
    if let Ok(meta) = tokio::fs::symlink_metadata(&target).await {
        if meta.is_dir() {
            return Err(CommandError::ExecutionFailed(format!("{requested}: is a directory")));
        }
    }

    let parent = target
        .parent()
        .ok_or_else(|| CommandError::InvalidPayload(format!("{requested}: no parent directory")))?;
    tokio::fs::create_dir_all(parent).await?;

    // Re-check now that the directories exist
    let target = resolve_for_write(root, requested).await?;
    let parent = target
        .parent()
        .ok_or_else(|| CommandError::InvalidPayload(format!("{requested}: no parent directory")))?;
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());

    let temp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
    tokio::fs::write(&temp, content).await?;
    if let Err(e) = tokio::fs::rename(&temp, &target).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }

    debug!("Wrote {} bytes to {}", content.len(), target.display());
    Ok(json!({
        "path": display_relative(root, &target),
        "bytes_written": content.len(),
    }))
}
