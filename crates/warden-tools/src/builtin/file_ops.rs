use std::fs;
use std::path::Path;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use walkdir::WalkDir;
use warden_common::path_guard::{
    canonicalize_existing_dir, resolve_existing_path_within, resolve_write_path_within,
};

use super::{MAX_OUTPUT_BYTES, cap_output};
use crate::{CapabilityClass, Tool, ToolContext, required_str, str_arg};

const DEFAULT_READ_LINES: u64 = 500;
const MAX_READ_LINES: u64 = 5000;
const MAX_SEARCH_HITS: usize = 200;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace. Returns numbered lines."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path relative to the workspace."},
                "offset": {"type": "integer", "description": "First line to return (1-based, default 1)."},
                "limit": {"type": "integer", "description": "Maximum lines to return (default 500)."}
            },
            "required": ["path"]
        })
    }

    fn capability(&self) -> CapabilityClass {
        CapabilityClass::Read
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String> {
        let root = canonicalize_existing_dir(&ctx.workspace)?;
        let file = resolve_existing_path_within(&root, required_str(&args, "path")?)?;
        if !file.is_file() {
            bail!("read_file target is not a file: {}", file.display());
        }
        let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(1).max(1);
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_READ_LINES)
            .clamp(1, MAX_READ_LINES);

        let bytes = fs::read(&file)?;
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.lines().collect();
        let numbered: Vec<String> = lines
            .iter()
            .enumerate()
            .skip((offset - 1) as usize)
            .take(limit as usize)
            .map(|(idx, line)| format!("{:>6}\t{line}", idx + 1))
            .collect();

        let header = format!(
            "File: {} ({} lines total, showing {})",
            display_relative(&root, &file),
            lines.len(),
            numbered.len()
        );
        Ok(cap_output(
            format!("{header}\n{}", numbered.join("\n")),
            MAX_OUTPUT_BYTES,
        ))
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a workspace file. Parent directories are created automatically."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path relative to the workspace."},
                "content": {"type": "string", "description": "Full file content."}
            },
            "required": ["path", "content"]
        })
    }

    fn capability(&self) -> CapabilityClass {
        CapabilityClass::Write
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String> {
        let root = canonicalize_existing_dir(&ctx.workspace)?;
        let content = required_str(&args, "content")?;
        let file = resolve_write_path_within(&root, required_str(&args, "path")?)?;
        fs::write(&file, content.as_bytes())?;
        tracing::info!(path = %file.display(), bytes = content.len(), "write_file");
        Ok(format!(
            "Wrote {} bytes to {}",
            content.len(),
            display_relative(&root, &file)
        ))
    }
}

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact text match in a workspace file. The match must be unique unless replace_all is set."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path relative to the workspace."},
                "old_string": {"type": "string", "description": "Exact text to replace."},
                "new_string": {"type": "string", "description": "Replacement text."},
                "replace_all": {"type": "boolean", "description": "Replace every occurrence (default false)."}
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    fn capability(&self) -> CapabilityClass {
        CapabilityClass::Write
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String> {
        let root = canonicalize_existing_dir(&ctx.workspace)?;
        let file = resolve_existing_path_within(&root, required_str(&args, "path")?)?;
        let old = required_str(&args, "old_string")?;
        let new = required_str(&args, "new_string")?;
        let replace_all = args
            .get("replace_all")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if old.is_empty() {
            bail!("old_string must not be empty");
        }

        let text = fs::read_to_string(&file)?;
        let count = text.matches(old).count();
        if count == 0 {
            bail!("old_string not found in {}", display_relative(&root, &file));
        }
        if count > 1 && !replace_all {
            bail!("old_string found {count} times; set replace_all or give more context");
        }
        let updated = if replace_all {
            text.replace(old, new)
        } else {
            text.replacen(old, new, 1)
        };
        fs::write(&file, updated)?;
        let replaced = if replace_all { count } else { 1 };
        Ok(format!(
            "Replaced {replaced} occurrence(s) in {}",
            display_relative(&root, &file)
        ))
    }
}

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a workspace directory. Directories end with '/'."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory relative to the workspace (default: workspace root)."}
            }
        })
    }

    fn capability(&self) -> CapabilityClass {
        CapabilityClass::Read
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String> {
        let root = canonicalize_existing_dir(&ctx.workspace)?;
        let dir = resolve_existing_path_within(&root, str_arg(&args, "path").unwrap_or(""))?;
        if !dir.is_dir() {
            bail!("list_dir target is not a directory: {}", dir.display());
        }
        let mut entries = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| {
                let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
                let marker = if is_dir { "/" } else { "" };
                format!("{}{}", entry.file_name().to_string_lossy(), marker)
            })
            .collect::<Vec<_>>();
        if entries.is_empty() {
            return Ok("(empty directory)".to_string());
        }
        entries.sort();
        Ok(entries.join("\n"))
    }
}

pub struct SearchTextTool;

#[async_trait]
impl Tool for SearchTextTool {
    fn name(&self) -> &str {
        "search_text"
    }

    fn description(&self) -> &str {
        "Search workspace files for a literal text fragment. Returns path:line:text hits."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Literal text to find."},
                "path": {"type": "string", "description": "File or directory to search (default: workspace root)."}
            },
            "required": ["pattern"]
        })
    }

    fn capability(&self) -> CapabilityClass {
        CapabilityClass::Read
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String> {
        let root = canonicalize_existing_dir(&ctx.workspace)?;
        let pattern = required_str(&args, "pattern")?;
        if pattern.is_empty() {
            bail!("search_text requires a non-empty pattern");
        }
        let scope = resolve_existing_path_within(&root, str_arg(&args, "path").unwrap_or(""))?;

        let mut hits = Vec::new();
        'files: for entry in WalkDir::new(&scope).follow_links(false) {
            let Ok(entry) = entry else {
                continue;
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };
            for (line_no, line) in content.lines().enumerate() {
                if line.contains(pattern) {
                    hits.push(format!(
                        "{}:{}:{}",
                        display_relative(&root, entry.path()),
                        line_no + 1,
                        line.trim()
                    ));
                    if hits.len() >= MAX_SEARCH_HITS {
                        break 'files;
                    }
                }
            }
        }

        if hits.is_empty() {
            return Ok(format!("No matches for '{pattern}'."));
        }
        Ok(cap_output(hits.join("\n"), MAX_OUTPUT_BYTES))
    }
}

fn display_relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx(root: &Path) -> ToolContext {
        ToolContext::for_session("cli:test", root.to_path_buf())
    }

    #[tokio::test]
    async fn write_then_read_with_line_window() {
        let tmp = tempdir().expect("tempdir");
        let ctx = ctx(tmp.path());
        WriteFileTool
            .execute(&ctx, json!({"path": "notes/a.txt", "content": "one\ntwo\nthree\n"}))
            .await
            .expect("write");

        let out = ReadFileTool
            .execute(&ctx, json!({"path": "notes/a.txt", "offset": 2, "limit": 1}))
            .await
            .expect("read");
        assert!(out.contains("3 lines total, showing 1"));
        assert!(out.contains("     2\ttwo"));
        assert!(!out.contains("three"));
    }

    #[tokio::test]
    async fn reads_outside_workspace_are_refused() {
        let tmp = tempdir().expect("tempdir");
        let err = ReadFileTool
            .execute(&ctx(tmp.path()), json!({"path": "/etc/hosts"}))
            .await
            .expect_err("escape");
        assert!(err.to_string().contains("workspace boundary"));
    }

    #[tokio::test]
    async fn edit_requires_unique_match_unless_replace_all() {
        let tmp = tempdir().expect("tempdir");
        let ctx = ctx(tmp.path());
        fs::write(tmp.path().join("a.txt"), "x = 1\nx = 1\n").expect("seed");

        let err = EditFileTool
            .execute(&ctx, json!({"path": "a.txt", "old_string": "x = 1", "new_string": "x = 2"}))
            .await
            .expect_err("ambiguous");
        assert!(err.to_string().contains("found 2 times"));

        EditFileTool
            .execute(
                &ctx,
                json!({"path": "a.txt", "old_string": "x = 1", "new_string": "x = 2", "replace_all": true}),
            )
            .await
            .expect("replace all");
        let text = fs::read_to_string(tmp.path().join("a.txt")).expect("read back");
        assert_eq!(text, "x = 2\nx = 2\n");
    }

    #[tokio::test]
    async fn list_and_search() {
        let tmp = tempdir().expect("tempdir");
        let ctx = ctx(tmp.path());
        fs::create_dir(tmp.path().join("src")).expect("mkdir");
        fs::write(tmp.path().join("src/lib.rs"), "fn main() {}\n// TODO: wire up\n").expect("seed");

        let listing = ListDirTool.execute(&ctx, json!({})).await.expect("list");
        assert_eq!(listing, "src/");

        let hits = SearchTextTool
            .execute(&ctx, json!({"pattern": "TODO"}))
            .await
            .expect("search");
        assert_eq!(hits, "src/lib.rs:2:// TODO: wire up");
    }
}
