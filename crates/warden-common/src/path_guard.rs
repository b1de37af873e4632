use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};

/// Canonicalizes and validates a workspace root directory used by tools and the policy engine.
pub fn canonicalize_existing_dir(path: &Path) -> Result<PathBuf> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("failed to canonicalize workspace root {}", path.display()))?;
    if !canonical.is_dir() {
        bail!("workspace root is not a directory: {}", canonical.display());
    }
    Ok(canonical)
}

/// Resolves an existing path and enforces it stays inside the workspace root.
pub fn resolve_existing_path_within(root: &Path, raw: &str) -> Result<PathBuf> {
    let candidate = if raw.trim().is_empty() {
        root.to_path_buf()
    } else {
        let p = PathBuf::from(raw.trim());
        if p.is_absolute() { p } else { root.join(p) }
    };
    let canonical = candidate
        .canonicalize()
        .with_context(|| format!("failed to resolve path {}", candidate.display()))?;
    if !canonical.starts_with(root) {
        bail!("path escapes workspace boundary");
    }
    Ok(canonical)
}

/// Resolves a write target and enforces its canonical parent stays inside the workspace root.
pub fn resolve_write_path_within(root: &Path, raw: &str) -> Result<PathBuf> {
    if raw.trim().is_empty() {
        bail!("write_file requires a non-empty path");
    }
    let p = PathBuf::from(raw.trim());
    let absolute = if p.is_absolute() { p } else { root.join(p) };
    let file_name = absolute
        .file_name()
        .ok_or_else(|| anyhow!("write path missing file name"))?
        .to_os_string();
    let parent = absolute
        .parent()
        .ok_or_else(|| anyhow!("write path must have a parent"))?;
    // Check before creating anything so an escaping path leaves no directories behind.
    if !resolve_lenient(root, &parent.to_string_lossy()).starts_with(root) {
        bail!("write path escapes workspace boundary");
    }
    fs::create_dir_all(parent)?;
    let canonical_parent = parent
        .canonicalize()
        .with_context(|| format!("failed to resolve parent {}", parent.display()))?;
    if !canonical_parent.starts_with(root) {
        bail!("write path escapes workspace boundary");
    }
    Ok(canonical_parent.join(file_name))
}

/// Resolves a path that may not exist yet, without touching the filesystem beyond reads.
///
/// `~` expands to the home directory and relative paths are joined onto `root`. Components
/// are walked in order: each existing prefix is canonicalized before the next component is
/// applied, so `..` after a symlink steps out of the link target rather than the link. Only
/// components that do not exist are kept lexically.
pub fn resolve_lenient(root: &Path, raw: &str) -> PathBuf {
    let raw = raw.trim();
    let expanded = if raw == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
    } else if let Some(rest) = raw.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .join(rest)
    } else {
        PathBuf::from(raw)
    };
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        root.join(expanded)
    };

    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                resolved.push(name);
                if let Ok(canonical) = resolved.canonicalize() {
                    resolved = canonical;
                }
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    resolved
}

/// True when `path` is `root` itself or a descendant of it.
pub fn is_within(root: &Path, path: &Path) -> bool {
    path.starts_with(root)
}
