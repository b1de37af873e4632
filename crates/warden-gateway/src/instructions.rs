use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use warden_common::WardenConfig;

const SECTION_BREAK: &str = "\n\n---\n\n";

const OPERATING_BRIEF: &str = "# Operating Brief\n\n\
You are Warden, a governed agent. Every tool call you make is checked before it runs: \
unapproved tools, destructive operations and paths outside the workspace are refused, \
and every call is recorded in an append-only audit log.\n\n\
- Act directly with tools when the request needs them; there is no confirmation step.\n\
- When a call comes back as [BLOCKED], tell the user it was blocked and why, then continue \
without it.\n\
- Use `manage_cron` for recurring or delayed work. Scheduled results are delivered to the \
chat that created the job. To remove a job, call `manage_cron` with action `remove` and the \
job's name; list first if unsure.\n\
- Use `manage_memory` to keep state between runs. Memory is scoped automatically, and a \
scheduled job sees its own memory in its prompt.\n\
- Use `spawn_subagent` to delegate a self-contained subtask and summarize its answer.\n\
- Prefer `web_fetch` against a reliable API for live data and cite the URL.";

/// Prompt material read once at startup: constitution, laws and skill playbooks.
#[derive(Debug, Clone, Default)]
pub struct Instructions {
    constitution: String,
    laws: String,
    skills: String,
}

impl Instructions {
    pub fn load(config: &WardenConfig) -> Self {
        let constitution = config
            .constitution_path
            .as_deref()
            .map(read_trimmed)
            .unwrap_or_default();
        Self {
            constitution,
            laws: config
                .laws_dir
                .as_deref()
                .map(concat_markdown)
                .unwrap_or_default(),
            skills: config
                .skills_dir
                .as_deref()
                .map(concat_markdown)
                .unwrap_or_default(),
        }
    }

    pub fn system_prompt(&self, tool_names: &[String], workspace: &Path, now: DateTime<Utc>) -> String {
        let mut parts = vec![format!(
            "# Current Time\n\n{}",
            now.format("%Y-%m-%d %H:%M:%S UTC")
        )];
        if !self.constitution.is_empty() {
            parts.push(format!("# Constitution\n\n{}", self.constitution));
        }
        if !self.laws.is_empty() {
            parts.push(format!("# Laws\n\n{}", self.laws));
        }
        if !self.skills.is_empty() {
            parts.push(format!("# Skill Playbooks\n\n{}", self.skills));
        }
        if !tool_names.is_empty() {
            let list = tool_names
                .iter()
                .map(|name| format!("- {name}"))
                .collect::<Vec<_>>()
                .join("\n");
            parts.push(format!("# Available Tools\n\n{list}"));
        }
        parts.push(format!(
            "# Environment\n\n- Workspace: `{}`. Commands run here and files are created here.",
            workspace.display()
        ));
        parts.push(OPERATING_BRIEF.to_string());
        parts.join(SECTION_BREAK)
    }
}

fn read_trimmed(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(text) => text.trim().to_string(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "could not read prompt file");
            String::new()
        }
    }
}

fn concat_markdown(dir: &Path) -> String {
    let Ok(entries) = fs::read_dir(dir) else {
        return String::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
        .collect();
    files.sort();
    files
        .iter()
        .map(|path| read_trimmed(path))
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(SECTION_BREAK)
}
