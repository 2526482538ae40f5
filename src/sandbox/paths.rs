//! Path confinement under the sandbox root.
//!
//! Every filesystem command resolves its user-supplied path here:
//!
//! 1. Lexical check: absolute paths and `..` components are rejected
//!    before touching the filesystem.
//! 2. Each component below the root is inspected with `symlink_metadata`;
//!    any symbolic link on the way is rejected, so a link swapped in
//!    between check and use cannot redirect the operation.
//! 3. The real (symlink-resolved) path of the target, or of its nearest
//!    existing ancestor for writes, must equal the root or sit strictly
//!    beneath it on a component boundary.
//!
//! The root itself is canonical (see `Config::validate`).

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::error::CommandError;

/// Splits `requested` into normal components relative to the root.
pub fn lexical_components(requested: &str) -> Result<Vec<String>, CommandError> {
    if requested.contains('\0') {
        return Err(CommandError::InvalidPayload("path contains a NUL byte".to_string()));
    }
    let trimmed = requested.trim();
    if trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(CommandError::PathTraversal(requested.to_string()));
    }

    let mut parts = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(CommandError::PathTraversal(requested.to_string()));
            }
        }
    }
    Ok(parts)
}

/// True when `real` is `root` or nested beneath it.
pub fn is_contained(root: &Path, real: &Path) -> bool {
    // Path::starts_with compares whole components, so "/srv/box2" is not under "/srv/box"
    real == root || real.starts_with(root)
}

/// Walk result: the joined path and how many leading components exist.
struct Walk {
    full: PathBuf,
    existing: usize,
}

/// Rejects any symbolic link among the existing components.
async fn walk_components(root: &Path, parts: &[String], requested: &str) -> Result<Walk, CommandError> {
    let mut current = root.to_path_buf();
    let mut existing = 0;
    let mut missing = false;

    for part in parts {
        current.push(part);
        if missing {
            continue;
        }
        match tokio::fs::symlink_metadata(&current).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(CommandError::PathTraversal(format!(
                    "{requested} (symbolic link at {})",
                    current.strip_prefix(root).unwrap_or(&current).display()
                )));
            }
            Ok(_) => existing += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => missing = true,
            Err(e) => return Err(CommandError::ExecutionFailed(format!("{requested}: {e}"))),
        }
    }

    Ok(Walk { full: current, existing })
}

async fn real_path_within(root: &Path, path: &Path, requested: &str) -> Result<PathBuf, CommandError> {
    let real = tokio::fs::canonicalize(path)
        .await
        .map_err(|e| CommandError::ExecutionFailed(format!("{requested}: {e}")))?;
    if !is_contained(root, &real) {
        return Err(CommandError::PathTraversal(requested.to_string()));
    }
    Ok(real)
}

/// Resolves a path that must already exist.
pub async fn resolve_existing(root: &Path, requested: &str) -> Result<PathBuf, CommandError> {
    let parts = lexical_components(requested)?;
    let walk = walk_components(root, &parts, requested).await?;
    if walk.existing < parts.len() {
        return Err(CommandError::ExecutionFailed(format!(
            "{requested}: no such file or directory"
        )));
    }
    real_path_within(root, &walk.full, requested).await
}

/// Resolves a write target, which may not exist yet.
///
/// When the target is missing, its nearest existing ancestor is
/// resolved instead and the missing tail is appended to that real path.
pub async fn resolve_for_write(root: &Path, requested: &str) -> Result<PathBuf, CommandError> {
    let parts = lexical_components(requested)?;
    if parts.is_empty() {
        return Err(CommandError::InvalidPayload(
            "write target must name a file below the sandbox root".to_string(),
        ));
    }
    let walk = walk_components(root, &parts, requested).await?;
    if walk.existing == parts.len() {
        return real_path_within(root, &walk.full, requested).await;
    }

    let mut ancestor = root.to_path_buf();
    for part in &parts[..walk.existing] {
        ancestor.push(part);
    }
    let mut target = real_path_within(root, &ancestor, requested).await?;
    for part in &parts[walk.existing..] {
        target.push(part);
    }
    Ok(target)
}

/// Display form of a resolved path, relative to the root.
pub fn display_relative(root: &Path, real: &Path) -> String {
    match real.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.display().to_string(),
        Err(_) => real.display().to_string(),
    }
}
