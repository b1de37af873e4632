use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::DateTime;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use warden_common::{APP_NAME, WardenConfig, logging};
use warden_core::{ApprovalLedger, ApprovalStatus};
use warden_gateway::{CronService, DeliverySink, ProgressSink, ProgressStep, WardenRuntime};
use warden_memory::MemoryStore;

const DEFAULT_SESSION: &str = "cli:direct";
const OPERATOR_ACTOR: &str = "operator";

#[derive(Debug, Parser)]
#[command(name = "warden", about = "Warden governed agent CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate local setup and generate default config if missing.
    Doctor,
    /// Send one message through the agent loop and print the reply.
    Chat {
        message: String,
        #[arg(long, default_value = DEFAULT_SESSION)]
        session: String,
    },
    /// Interactive session on stdin with the scheduler running in the background.
    Gateway {
        #[arg(long, default_value = DEFAULT_SESSION)]
        session: String,
    },
    /// Tool approval ledger.
    Tool {
        #[command(subcommand)]
        command: ToolCommand,
    },
    /// Show recent audit entries.
    Audit {
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Scheduled jobs.
    Cron {
        #[command(subcommand)]
        command: CronCommand,
    },
    /// Namespaced agent memory.
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
    /// Show stored conversation history for a session.
    History {
        #[arg(default_value = DEFAULT_SESSION)]
        session: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
enum ToolCommand {
    /// List every known tool with its approval status.
    List,
    /// Approve a tool for use.
    Approve { name: String },
    /// Ban a tool; banned tools are never executed.
    Ban { name: String },
}

#[derive(Debug, Subcommand)]
enum CronCommand {
    /// Add a job. Interval values are seconds, once values are RFC 3339 or a delay in seconds.
    Add {
        name: String,
        message: String,
        #[arg(long, default_value = "interval")]
        schedule_type: String,
        #[arg(long)]
        schedule: String,
        #[arg(long, default_value = DEFAULT_SESSION)]
        chat_id: String,
    },
    List,
    /// Remove jobs by id or name.
    Remove { id_or_name: String },
    /// Make a job due on the next scheduler tick.
    Trigger { job_id: String },
}

#[derive(Debug, Subcommand)]
enum MemoryCommand {
    /// List entries in a namespace such as `job:<id>` or `session:cli:direct`.
    List { namespace: String },
    /// Delete one entry.
    Delete { namespace: String, name: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Doctor) => doctor(),
        Some(Command::Chat { message, session }) => chat(&message, &session),
        Some(Command::Gateway { session }) => gateway(&session),
        Some(Command::Tool { command }) => tool(command),
        Some(Command::Audit { session, limit }) => audit(session.as_deref(), limit),
        Some(Command::Cron { command }) => cron(command),
        Some(Command::Memory { command }) => memory(command),
        Some(Command::History { session, limit }) => history(&session, limit),
        None => {
            println!("{APP_NAME} CLI ready.");
            println!("Run `warden doctor` to generate and validate local config.");
            Ok(())
        }
    }
}

fn load_initialized_config() -> Result<WardenConfig> {
    let (config, _, _) = WardenConfig::load_or_create()?;
    config.validate_and_prepare()?;
    logging::init(&config.log_level);
    Ok(config)
}

fn open_store(config: &WardenConfig) -> Result<Arc<MemoryStore>> {
    Ok(Arc::new(MemoryStore::open(&config.db_path)?))
}

fn async_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn doctor() -> Result<()> {
    let (config, path, created) = WardenConfig::load_or_create()?;
    config.validate_and_prepare()?;
    logging::init(&config.log_level);
    let store = open_store(&config)?;

    println!("{APP_NAME} doctor: OK");
    println!("config: {}", path.display());
    println!("workspace: {}", config.workspace_dir.display());
    println!("database: {}", store.db_path().display());
    println!("model: {} ({:?})", config.model.model_id, config.model.provider);
    println!(
        "endpoint: {}",
        config.model.endpoint.as_deref().unwrap_or("<provider default>")
    );
    if let Some(env_var) = &config.model.api_key_env {
        let present = std::env::var(env_var).is_ok_and(|value| !value.is_empty());
        println!("api_key_env: {env_var} (set: {present})");
    }
    println!("scheduler_enabled: {}", config.scheduler.enabled);
    println!("created_config: {created}");
    Ok(())
}

fn chat(message: &str, session: &str) -> Result<()> {
    let config = load_initialized_config()?;
    let runtime = WardenRuntime::from_config(config)?;
    let reply = async_runtime()?.block_on(runtime.agent().process(
        message,
        session,
        Some(&StderrProgress),
    ))?;
    println!("{reply}");
    Ok(())
}

fn gateway(session: &str) -> Result<()> {
    let config = load_initialized_config()?;
    let rt = async_runtime()?;
    rt.block_on(async {
        let runtime = WardenRuntime::from_config(config)?;
        let scheduler = runtime.start_scheduler(Arc::new(StdoutDelivery));

        println!("{APP_NAME} gateway ready (session {session}). Type a message, Ctrl-C to exit.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                line = lines.next_line() => {
                    let Some(line) = line.context("failed to read stdin")? else {
                        break;
                    };
                    let message = line.trim();
                    if message.is_empty() {
                        continue;
                    }
                    match runtime.agent().process(message, session, Some(&StderrProgress)).await {
                        Ok(reply) => println!("{reply}"),
                        Err(err) => eprintln!("error: {err:#}"),
                    }
                }
            }
        }

        runtime.cron().stop();
        if let Some(handle) = scheduler {
            let _ = handle.await;
        }
        tracing::info!("gateway shut down");
        Ok::<(), anyhow::Error>(())
    })
}

fn tool(command: ToolCommand) -> Result<()> {
    let config = load_initialized_config()?;
    let store = open_store(&config)?;

    match command {
        ToolCommand::List => {
            let rows = store.list_tool_approvals()?;
            println!("tools: {}", rows.len());
            for row in rows {
                println!(
                    "- {} [{}] {}",
                    row.name,
                    row.status,
                    row.approved_by.as_deref().unwrap_or("-")
                );
            }
        }
        ToolCommand::Approve { name } => {
            set_status(&store, &name, ApprovalStatus::Approved)?;
            println!("tool_approved: {name}");
        }
        ToolCommand::Ban { name } => {
            set_status(&store, &name, ApprovalStatus::Banned)?;
            println!("tool_banned: {name}");
        }
    }
    Ok(())
}

fn set_status(store: &MemoryStore, name: &str, status: ApprovalStatus) -> Result<()> {
    if store.get_tool_approval(name)?.is_none() {
        bail!("unknown tool '{name}'; run the agent once so built-in tools are registered");
    }
    store.set_tool_status(name, status, Some(OPERATOR_ACTOR))
}

fn audit(session: Option<&str>, limit: usize) -> Result<()> {
    let config = load_initialized_config()?;
    let store = open_store(&config)?;
    let rows = store.list_audit(session, limit)?;
    println!("entries: {}", rows.len());
    for row in rows {
        println!(
            "- #{} {} {} [{}] {} args={}{}",
            row.id,
            format_ms(Some(row.created_at_ms)),
            row.session_key.as_deref().unwrap_or("-"),
            row.verdict,
            row.tool_name,
            row.arguments,
            row.reason
                .as_deref()
                .map(|reason| format!(" reason={reason}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn cron(command: CronCommand) -> Result<()> {
    let config = load_initialized_config()?;
    let store = open_store(&config)?;
    let service = CronService::new(
        store,
        std::time::Duration::from_secs(config.scheduler.tick_secs),
    );

    match command {
        CronCommand::Add {
            name,
            message,
            schedule_type,
            schedule,
            chat_id,
        } => {
            let id = service.add(&name, &message, &chat_id, &schedule_type, &schedule)?;
            println!("job_id: {id}");
        }
        CronCommand::List => {
            let jobs = service.list()?;
            println!("jobs: {}", jobs.len());
            for job in jobs {
                println!(
                    "- {} {} {}={} enabled={} next={} last={} status={}",
                    job.id,
                    job.name,
                    job.schedule_type,
                    job.schedule_value,
                    job.enabled,
                    format_ms(job.next_run_at_ms),
                    format_ms(job.last_run_at_ms),
                    job.last_status.as_deref().unwrap_or("-")
                );
                if let Some(err) = &job.last_error {
                    println!("  last_error: {err}");
                }
            }
        }
        CronCommand::Remove { id_or_name } => {
            let removed = service.remove(&id_or_name)?;
            println!("removed: {removed}");
        }
        CronCommand::Trigger { job_id } => {
            if !service.trigger(&job_id)? {
                bail!("no cron job with id '{job_id}'");
            }
            println!("triggered: {job_id}");
        }
    }
    Ok(())
}

fn memory(command: MemoryCommand) -> Result<()> {
    let config = load_initialized_config()?;
    let store = open_store(&config)?;

    match command {
        MemoryCommand::List { namespace } => {
            let entries = store.memory_list(&namespace)?;
            println!("entries: {}", entries.len());
            for entry in entries {
                println!("- {} = {}", entry.name, entry.value);
            }
        }
        MemoryCommand::Delete { namespace, name } => {
            let deleted = store.memory_delete(&namespace, &name)?;
            println!("deleted: {deleted}");
        }
    }
    Ok(())
}

fn history(session: &str, limit: usize) -> Result<()> {
    let config = load_initialized_config()?;
    let store = open_store(&config)?;
    let messages = store.get_history(session, limit)?;
    println!("messages: {}", messages.len());
    for message in messages {
        let tools = message
            .tools_used
            .map(|tools| format!(" (tools: {})", tools.join(", ")))
            .unwrap_or_default();
        println!(
            "[{}] {}{}: {}",
            format_ms(Some(message.created_at_ms)),
            message.role,
            tools,
            message.content
        );
    }
    Ok(())
}

fn format_ms(ms: Option<i64>) -> String {
    ms.and_then(DateTime::from_timestamp_millis)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn on_step(&self, step: &ProgressStep) -> Result<()> {
        let marker = if step.allowed { "tool" } else { "blocked" };
        eprintln!("[{marker}] {} {}", step.tool_name, step.arguments);
        Ok(())
    }
}

struct StdoutDelivery;

#[async_trait]
impl DeliverySink for StdoutDelivery {
    async fn deliver(&self, chat_id: &str, text: &str) -> Result<()> {
        println!("[scheduled -> {chat_id}] {text}");
        Ok(())
    }
}
