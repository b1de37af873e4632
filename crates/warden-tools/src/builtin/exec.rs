use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;
use warden_common::path_guard::canonicalize_existing_dir;

use super::{MAX_OUTPUT_BYTES, cap_output};
use crate::{CapabilityClass, Tool, ToolContext, required_str};

const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 120;

/// Environment variable name fragments that are never passed to child shells.
const SECRET_ENV_MARKERS: &[&str] = &["API_KEY", "TOKEN", "SECRET", "PASSWORD", "PASSWD", "CREDENTIAL"];

pub struct ExecCmdTool {
    default_timeout_secs: u64,
}

impl ExecCmdTool {
    pub fn new(default_timeout_secs: u64) -> Self {
        Self {
            default_timeout_secs: default_timeout_secs.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS),
        }
    }
}

#[async_trait]
impl Tool for ExecCmdTool {
    fn name(&self) -> &str {
        "exec_cmd"
    }

    fn description(&self) -> &str {
        "Execute a shell command inside the workspace and return its exit code, stdout and stderr."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to execute."},
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 30, max 120)."
                }
            },
            "required": ["command"]
        })
    }

    fn capability(&self) -> CapabilityClass {
        CapabilityClass::Exec
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String> {
        let command = required_str(&args, "command")?.trim().to_string();
        if command.is_empty() {
            bail!("exec_cmd requires a non-empty command");
        }
        let timeout_secs = args
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(self.default_timeout_secs)
            .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
        let workspace = canonicalize_existing_dir(&ctx.workspace)?;

        tracing::info!(
            session = %ctx.session_key,
            timeout_secs,
            command = %warden_core::truncate_chars(&command, 100),
            "exec_cmd"
        );

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, _) in std::env::vars_os() {
            if is_secret_env(&key.to_string_lossy()) {
                cmd.env_remove(&key);
            }
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn shell for '{command}'"))?;
        let output = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            child.wait_with_output(),
        )
        .await
        {
            Ok(result) => result.context("failed to collect command output")?,
            Err(_) => bail!("command timed out after {timeout_secs}s"),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "terminated by signal".to_string());

        let mut parts = vec![format!("Exit code: {code}")];
        if !stdout.is_empty() {
            parts.push(format!("STDOUT:\n{stdout}"));
        }
        if !stderr.is_empty() {
            parts.push(format!("STDERR:\n{stderr}"));
        }
        if stdout.is_empty() && stderr.is_empty() {
            parts.push("(no output)".to_string());
        }
        Ok(cap_output(parts.join("\n\n"), MAX_OUTPUT_BYTES))
    }
}

fn is_secret_env(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SECRET_ENV_MARKERS.iter().any(|marker| upper.contains(marker))
}
