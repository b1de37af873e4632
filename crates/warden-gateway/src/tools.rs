use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{Value, json};
use warden_tools::{CapabilityClass, Tool, ToolContext};

use crate::scheduler::CronService;
use crate::subagent::{SUBAGENT_TOOL_NAME, SubagentSpawner};

pub struct ManageCronTool {
    cron: Arc<CronService>,
    min_interval_secs: u64,
}

impl ManageCronTool {
    pub fn new(cron: Arc<CronService>, min_interval_secs: u64) -> Self {
        Self {
            cron,
            min_interval_secs: min_interval_secs.max(1),
        }
    }

    fn add(&self, ctx: &ToolContext, args: &Value) -> Result<String> {
        let name = arg(args, "name");
        let message = arg(args, "message");
        if name.is_empty() || message.is_empty() {
            bail!("'name' and 'message' are required for add");
        }
        let kind = match arg(args, "schedule_type") {
            "" => "interval",
            other => other,
        };

        let (value, summary) = if kind == "interval" {
            let requested = args
                .get("interval_seconds")
                .and_then(Value::as_u64)
                .unwrap_or(self.min_interval_secs);
            let interval = requested.max(self.min_interval_secs);
            (interval.to_string(), format!("runs every {interval}s"))
        } else {
            let value = arg(args, "schedule").to_string();
            let summary = format!("{kind} schedule '{value}'");
            (value, summary)
        };

        let job_id = self.cron.add(name, message, &ctx.chat_id, kind, &value)?;
        Ok(format!("Cron job created: '{name}' (ID: {job_id}), {summary}."))
    }
}

#[async_trait]
impl Tool for ManageCronTool {
    fn name(&self) -> &str {
        "manage_cron"
    }

    fn description(&self) -> &str {
        "Manage scheduled jobs. 'add' creates a job (name, message, interval_seconds, or schedule_type once/cron with schedule), 'remove' deletes by job_id or name, 'list' shows all jobs."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["add", "remove", "list"]},
                "name": {"type": "string", "description": "Job name (add, or remove by name)."},
                "message": {"type": "string", "description": "Prompt the agent runs each time the job fires (add)."},
                "interval_seconds": {
                    "type": "integer",
                    "description": format!("Run every N seconds. Minimum {}.", self.min_interval_secs)
                },
                "schedule_type": {"type": "string", "enum": ["interval", "once", "cron"]},
                "schedule": {"type": "string", "description": "RFC 3339 time or delay seconds (once), or cron expression (cron)."},
                "job_id": {"type": "string", "description": "Job ID (remove)."}
            },
            "required": ["action"]
        })
    }

    fn capability(&self) -> CapabilityClass {
        CapabilityClass::System
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String> {
        match arg(&args, "action") {
            "add" => self.add(ctx, &args),
            "remove" => {
                let target = match arg(&args, "job_id") {
                    "" => arg(&args, "name"),
                    id => id,
                };
                if target.is_empty() {
                    bail!("'job_id' or 'name' is required for remove");
                }
                match self.cron.remove(target)? {
                    0 => Ok(format!("No cron job matches '{target}'.")),
                    n => Ok(format!("Removed {n} cron job(s) matching '{target}'.")),
                }
            }
            "list" => {
                let jobs = self.cron.list()?;
                if jobs.is_empty() {
                    return Ok("No cron jobs.".to_string());
                }
                Ok(jobs
                    .iter()
                    .map(|job| {
                        let next = job
                            .next_run_at_ms
                            .and_then(DateTime::from_timestamp_millis)
                            .map(|at| at.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string());
                        format!(
                            "- {} (ID: {}) {} {} [{}] enabled={} next={}",
                            job.name,
                            job.id,
                            job.schedule_type,
                            job.schedule_value,
                            job.last_status.as_deref().unwrap_or("pending"),
                            job.enabled,
                            next
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            other => bail!("unknown action '{other}'"),
        }
    }
}

pub struct SpawnSubagentTool {
    spawner: Arc<SubagentSpawner>,
}

impl SpawnSubagentTool {
    pub fn new(spawner: Arc<SubagentSpawner>) -> Self {
        Self { spawner }
    }
}

#[async_trait]
impl Tool for SpawnSubagentTool {
    fn name(&self) -> &str {
        SUBAGENT_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Delegate a self-contained task to a sub-agent. It runs with its own context, may use tools, and returns a text result."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "Clear description of the task."}
            },
            "required": ["task"]
        })
    }

    fn capability(&self) -> CapabilityClass {
        CapabilityClass::System
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String> {
        let task = arg(&args, "task").trim();
        if task.is_empty() {
            bail!("'task' is required");
        }
        self.spawner.spawn(task, ctx).await
    }
}

fn arg<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or("")
}
