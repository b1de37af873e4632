use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use warden_common::path_guard::{is_within, resolve_lenient};
use warden_core::{ApprovalLedger, ApprovalStatus, Verdict};

/// Destructive operations rejected for every tool, regardless of approval.
const DESTRUCTIVE_PATTERNS: &[&str] = &[
    r"rm\s+-[rf]+\s+/",
    r"rm\s+-[rf]+\s+~",
    r"rm\s+--no-preserve-root",
    r"mkfs\.",
    r"dd\s+if=",
    r":\(\)\s*\{.*:\|:&\s*\}",
    r"drop\s+table",
    r"drop\s+database",
    r"truncate\s+table",
    r"shutdown\s+-[h]",
    r"\bhalt\b",
    r"\bpoweroff\b",
    r"\breboot\b",
    r"format\s+[a-z]:",
    r"del\s+/s\s+/q",
    r"chmod\s+-R\s+777\s+/",
    r"chown\s+-R\s+.*\s+/",
    r">\s*/dev/sd[a-z]",
    r"curl.*\|\s*(ba)?sh",
    r"wget.*\|\s*(ba)?sh",
    r"base64\s+-d.*\|\s*(ba)?sh",
];

/// String leaves longer than this are treated as prose, not paths.
const MAX_PATH_LEAF_CHARS: usize = 500;

/// Device sinks that commands may redirect into without leaving the workspace.
const HARMLESS_DEVICES: &[&str] = &["/dev/null", "/dev/stdout", "/dev/stderr"];

/// Pre-execution gate for every tool invocation.
///
/// Checks run in order and stop at the first rejection: approval state from the ledger, the
/// destructive pattern set over the canonical argument text, then workspace containment for
/// tools registered as filesystem-capable. Apart from `approve`/`ban`/`register`, a check
/// has no side effects.
pub struct PolicyEngine {
    ledger: Arc<dyn ApprovalLedger>,
    workspace: PathBuf,
    patterns: Vec<Regex>,
    contained: HashSet<String>,
}

impl PolicyEngine {
    pub fn new(ledger: Arc<dyn ApprovalLedger>, workspace: PathBuf) -> Result<Self> {
        let patterns = DESTRUCTIVE_PATTERNS
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("invalid destructive pattern {pattern}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            ledger,
            workspace,
            patterns,
            contained: HashSet::new(),
        })
    }

    /// Tools whose string arguments must stay inside the workspace.
    pub fn with_contained_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contained.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn pre_check(&self, tool_name: &str, args: &Value) -> Verdict {
        match self.ledger.tool_status(tool_name) {
            Ok(ApprovalStatus::Approved) => {}
            Ok(ApprovalStatus::Banned) => {
                let reason = format!("Tool '{tool_name}' is banned and cannot be used.");
                tracing::warn!(tool = %tool_name, "blocked banned tool");
                return Verdict::block(reason);
            }
            Ok(ApprovalStatus::Pending) => {
                let reason = format!("Tool '{tool_name}' has not been approved for use.");
                tracing::warn!(tool = %tool_name, "blocked unapproved tool");
                return Verdict::block(reason);
            }
            Err(err) => {
                tracing::error!(tool = %tool_name, error = %err, "approval lookup failed");
                return Verdict::block(format!(
                    "Approval state for tool '{tool_name}' could not be read."
                ));
            }
        }

        let Some(canonical) = canonical_json(args) else {
            tracing::warn!(tool = %tool_name, "blocked malformed arguments");
            return Verdict::block(format!(
                "Arguments for '{tool_name}' are malformed; expected a JSON object."
            ));
        };

        if let Some(pattern) = self.patterns.iter().find(|re| re.is_match(&canonical)) {
            tracing::warn!(tool = %tool_name, pattern = %pattern.as_str(), "blocked destructive arguments");
            return Verdict::block(format!(
                "Arguments for '{tool_name}' contain a destructive operation."
            ));
        }

        if self.contained.contains(tool_name) {
            if let Some(escape) = self.first_escaping_path(args) {
                tracing::warn!(tool = %tool_name, path = %escape, "blocked path outside workspace");
                return Verdict::block(format!(
                    "Path '{}' is outside the workspace directory.",
                    warden_core::truncate_chars(&escape, 200)
                ));
            }
        }

        Verdict::allow()
    }

    pub fn approve(&self, tool_name: &str, actor: Option<&str>) -> Result<()> {
        self.ledger
            .set_tool_status(tool_name, ApprovalStatus::Approved, actor)?;
        tracing::info!(tool = %tool_name, actor = actor.unwrap_or("-"), "tool approved");
        Ok(())
    }

    pub fn ban(&self, tool_name: &str, actor: Option<&str>) -> Result<()> {
        self.ledger
            .set_tool_status(tool_name, ApprovalStatus::Banned, actor)?;
        tracing::info!(tool = %tool_name, actor = actor.unwrap_or("-"), "tool banned");
        Ok(())
    }

    pub fn register(&self, tool_name: &str, description: &str) -> Result<()> {
        self.ledger.register_tool(tool_name, description)
    }

    fn first_escaping_path(&self, args: &Value) -> Option<String> {
        let mut leaves = Vec::new();
        collect_string_leaves(args, &mut leaves);
        leaves
            .into_iter()
            .filter(|leaf| leaf.chars().count() <= MAX_PATH_LEAF_CHARS)
            .flat_map(split_tokens)
            .filter_map(|token| path_candidate(&token).map(str::to_string))
            .find(|candidate| {
                let resolved = resolve_lenient(&self.workspace, candidate);
                !is_within(&self.workspace, &resolved)
            })
    }
}

/// Compact JSON with object keys sorted at every level. `None` when `args` is not an object.
pub fn canonical_json(args: &Value) -> Option<String> {
    if !args.is_object() {
        return None;
    }
    serde_json::to_string(&sorted(args)).ok()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

fn collect_string_leaves<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(text) => out.push(text),
        Value::Array(items) => items.iter().for_each(|item| collect_string_leaves(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_string_leaves(item, out)),
        _ => {}
    }
}

fn split_tokens(leaf: &str) -> Vec<String> {
    shlex::split(leaf)
        .unwrap_or_else(|| leaf.split_whitespace().map(str::to_string).collect())
}

/// Strips redirections and `key=` prefixes and returns the token if it names a path.
fn path_candidate(token: &str) -> Option<&str> {
    let token = match token.trim_start_matches(|c: char| c.is_ascii_digit()) {
        redirect if redirect.starts_with(['<', '>']) => redirect,
        _ => token,
    };
    let token = token.trim_start_matches(['<', '>', '&']);
    let token = match token.split_once('=') {
        Some((key, rest))
            if !key.is_empty()
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
        {
            rest
        }
        _ => token,
    };
    if token.is_empty() || token.contains("://") || HARMLESS_DEVICES.contains(&token) {
        return None;
    }
    let looks_like_path = token.contains('/') || token.contains('\\') || token.starts_with('~');
    looks_like_path.then_some(token)
}
