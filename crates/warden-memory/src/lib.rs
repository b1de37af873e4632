use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};
use warden_core::{ApprovalLedger, ApprovalStatus, JobStatus, Role, now_epoch_ms};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub session_key: String,
    pub role: String,
    pub content: String,
    pub tools_used: Option<Vec<String>>,
    pub created_at_ms: i64,
}

pub struct NewAuditEntry<'a> {
    pub session_key: Option<&'a str>,
    pub tool_name: &'a str,
    pub arguments: &'a str,
    pub result: &'a str,
    pub verdict: &'a str,
    pub reason: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub id: i64,
    pub session_key: Option<String>,
    pub tool_name: String,
    pub arguments: String,
    pub result: String,
    pub verdict: String,
    pub reason: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct ToolApprovalRecord {
    pub name: String,
    pub status: String,
    pub description: String,
    pub approved_by: Option<String>,
    pub approved_at_ms: Option<i64>,
    pub created_at_ms: i64,
}

pub struct NewCronJob<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub message: &'a str,
    pub chat_id: &'a str,
    pub schedule_type: &'a str,
    pub schedule_value: &'a str,
    pub next_run_at_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CronJobRecord {
    pub id: String,
    pub name: String,
    pub message: String,
    pub chat_id: String,
    pub schedule_type: String,
    pub schedule_value: String,
    pub enabled: bool,
    pub next_run_at_ms: Option<i64>,
    pub last_run_at_ms: Option<i64>,
    pub last_status: Option<String>,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    pub name: String,
    pub value: String,
    pub updated_at_ms: i64,
}

/// Single source of truth for messages, audit entries, tool approvals, cron jobs and
/// namespaced memory. Writes go through one connection and reads through a second
/// query-only one, so under WAL a long write never stalls a reader. No statement holds
/// either lock across an await point because every method here is synchronous.
pub struct MemoryStore {
    conn: Mutex<Connection>,
    reader: Mutex<Connection>,
    db_path: PathBuf,
}

const CRON_COLUMNS: &str = "id, name, message, chat_id, schedule_type, schedule_value, enabled,
     next_run_at_ms, last_run_at_ms, last_status, last_error, created_at_ms";

impl MemoryStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists so sqlite can create/open the db file.
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db directory {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database at {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .context("failed to configure sqlite pragmas")?;
        Self::migrate(&conn)?;
        // Opened after migrating so the schema is already visible to it.
        let reader = Connection::open(db_path)
            .with_context(|| format!("failed to open read connection at {}", db_path.display()))?;
        reader
            .execute_batch("PRAGMA busy_timeout=5000; PRAGMA query_only=ON;")
            .context("failed to configure sqlite read connection")?;
        Ok(Self {
            conn: Mutex::new(conn),
            reader: Mutex::new(reader),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("memory store connection lock poisoned"))
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| anyhow!("memory store read connection lock poisoned"))
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
              version INTEGER PRIMARY KEY,
              name TEXT NOT NULL,
              applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        apply_migration(
            conn,
            1,
            "base_agent_tables",
            &[
                "CREATE TABLE IF NOT EXISTS messages (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  session_key TEXT NOT NULL,
                  role TEXT NOT NULL,
                  content TEXT NOT NULL,
                  tools_used TEXT,
                  created_at_ms INTEGER NOT NULL
                )",
                "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_key, id)",
                "CREATE TABLE IF NOT EXISTS memory (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  key TEXT UNIQUE NOT NULL,
                  value TEXT NOT NULL,
                  updated_at_ms INTEGER NOT NULL
                )",
                "CREATE TABLE IF NOT EXISTS audit_log (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  session_key TEXT,
                  tool_name TEXT NOT NULL,
                  arguments TEXT NOT NULL,
                  result TEXT NOT NULL,
                  verdict TEXT NOT NULL,
                  reason TEXT,
                  created_at_ms INTEGER NOT NULL
                )",
                "CREATE INDEX IF NOT EXISTS idx_audit_session ON audit_log(session_key, id)",
                "CREATE TABLE IF NOT EXISTS cron_jobs (
                  id TEXT PRIMARY KEY,
                  name TEXT NOT NULL,
                  message TEXT NOT NULL,
                  chat_id TEXT NOT NULL,
                  schedule_type TEXT NOT NULL,
                  schedule_value TEXT NOT NULL,
                  enabled INTEGER NOT NULL DEFAULT 1,
                  next_run_at_ms INTEGER,
                  last_run_at_ms INTEGER,
                  last_status TEXT,
                  last_error TEXT,
                  created_at_ms INTEGER NOT NULL
                )",
                "CREATE INDEX IF NOT EXISTS idx_cron_due ON cron_jobs(enabled, next_run_at_ms)",
            ],
        )?;

        apply_migration(
            conn,
            2,
            "tool_approvals",
            &["CREATE TABLE IF NOT EXISTS tool_approvals (
                  name TEXT PRIMARY KEY,
                  status TEXT NOT NULL DEFAULT 'pending',
                  description TEXT NOT NULL DEFAULT '',
                  approved_by TEXT,
                  approved_at_ms INTEGER,
                  created_at_ms INTEGER NOT NULL
                )"],
        )?;

        apply_migration(
            conn,
            3,
            "append_only_audit",
            &[
                "CREATE TRIGGER IF NOT EXISTS audit_log_no_update
                 BEFORE UPDATE ON audit_log
                 BEGIN SELECT RAISE(ABORT, 'audit_log is append-only'); END",
                "CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
                 BEFORE DELETE ON audit_log
                 BEGIN SELECT RAISE(ABORT, 'audit_log is append-only'); END",
            ],
        )?;

        Ok(())
    }

    // -- messages --

    pub fn add_message(
        &self,
        session_key: &str,
        role: Role,
        content: &str,
        tools_used: Option<&[String]>,
    ) -> Result<i64> {
        let tools_json = tools_used
            .filter(|names| !names.is_empty())
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (session_key, role, content, tools_used, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_key,
                role.as_str(),
                content,
                tools_json,
                now_epoch_ms()
            ],
        )
        .with_context(|| format!("failed to persist {} message", role.as_str()))?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent `limit` messages of a session, oldest first.
    pub fn get_history(&self, session_key: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_key, role, content, tools_used, created_at_ms
             FROM messages
             WHERE session_key = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_key, limit as i64], |row| {
            let tools_raw: Option<String> = row.get(4)?;
            Ok(StoredMessage {
                id: row.get(0)?,
                session_key: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                tools_used: tools_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
                created_at_ms: row.get(5)?,
            })
        })?;
        let mut messages = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    // -- audit --

    pub fn append_audit(&self, entry: &NewAuditEntry<'_>) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_log
             (session_key, tool_name, arguments, result, verdict, reason, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.session_key,
                entry.tool_name,
                entry.arguments,
                entry.result,
                entry.verdict,
                entry.reason,
                now_epoch_ms()
            ],
        )
        .with_context(|| format!("failed to append audit entry for '{}'", entry.tool_name))?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest-first audit entries, optionally scoped to one session.
    pub fn list_audit(&self, session_key: Option<&str>, limit: usize) -> Result<Vec<AuditRecord>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_key, tool_name, arguments, result, verdict, reason, created_at_ms
             FROM audit_log
             WHERE ?1 IS NULL OR session_key = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_key, limit as i64], |row| {
            Ok(AuditRecord {
                id: row.get(0)?,
                session_key: row.get(1)?,
                tool_name: row.get(2)?,
                arguments: row.get(3)?,
                result: row.get(4)?,
                verdict: row.get(5)?,
                reason: row.get(6)?,
                created_at_ms: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -- tool approvals --

    pub fn get_tool_approval(&self, name: &str) -> Result<Option<ToolApprovalRecord>> {
        let conn = self.reader()?;
        let record = conn
            .query_row(
                "SELECT name, status, description, approved_by, approved_at_ms, created_at_ms
                 FROM tool_approvals
                 WHERE name = ?1",
                params![name],
                tool_approval_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_tool_approvals(&self) -> Result<Vec<ToolApprovalRecord>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT name, status, description, approved_by, approved_at_ms, created_at_ms
             FROM tool_approvals
             ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], tool_approval_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -- cron jobs --

    pub fn insert_cron_job(&self, job: &NewCronJob<'_>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cron_jobs
             (id, name, message, chat_id, schedule_type, schedule_value, enabled, next_run_at_ms, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)",
            params![
                job.id,
                job.name,
                job.message,
                job.chat_id,
                job.schedule_type,
                job.schedule_value,
                job.next_run_at_ms,
                now_epoch_ms()
            ],
        )
        .with_context(|| format!("failed to insert cron job '{}'", job.name))?;
        Ok(())
    }

    /// Enabled jobs whose `next_run_at_ms` is at or before `now_ms`.
    pub fn due_cron_jobs(&self, now_ms: i64) -> Result<Vec<CronJobRecord>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CRON_COLUMNS}
             FROM cron_jobs
             WHERE enabled = 1 AND next_run_at_ms IS NOT NULL AND next_run_at_ms <= ?1
             ORDER BY next_run_at_ms ASC"
        ))?;
        let rows = stmt.query_map(params![now_ms], cron_job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_cron_job(&self, job_id: &str) -> Result<Option<CronJobRecord>> {
        let conn = self.reader()?;
        let job = conn
            .query_row(
                &format!("SELECT {CRON_COLUMNS} FROM cron_jobs WHERE id = ?1"),
                params![job_id],
                cron_job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn list_cron_jobs(&self) -> Result<Vec<CronJobRecord>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CRON_COLUMNS} FROM cron_jobs ORDER BY created_at_ms ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], cron_job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Records the outcome of one run and the next due time in a single transaction.
    /// `next_run_at_ms = None` disables the job.
    pub fn finish_cron_run(
        &self,
        job_id: &str,
        finished_at_ms: i64,
        status: JobStatus,
        error: Option<&str>,
        next_run_at_ms: Option<i64>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE cron_jobs
             SET last_run_at_ms = ?1, last_status = ?2, last_error = ?3
             WHERE id = ?4",
            params![finished_at_ms, status.as_str(), error, job_id],
        )?;
        match next_run_at_ms {
            Some(next) => tx.execute(
                "UPDATE cron_jobs SET next_run_at_ms = ?1 WHERE id = ?2",
                params![next, job_id],
            )?,
            None => tx.execute(
                "UPDATE cron_jobs SET enabled = 0, next_run_at_ms = NULL WHERE id = ?1",
                params![job_id],
            )?,
        };
        tx.commit()?;
        Ok(())
    }

    /// Moves a job's next due time and re-enables it; false when the job does not exist.
    pub fn set_cron_next_run(&self, job_id: &str, next_run_at_ms: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE cron_jobs SET next_run_at_ms = ?1, enabled = 1 WHERE id = ?2",
            params![next_run_at_ms, job_id],
        )?;
        Ok(changed > 0)
    }

    /// Deletes jobs whose id or name equals `id_or_name`.
    pub fn remove_cron_jobs(&self, id_or_name: &str) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM cron_jobs WHERE id = ?1 OR name = ?1",
            params![id_or_name],
        )?;
        Ok(removed)
    }

    // -- namespaced memory --

    pub fn memory_set(&self, namespace: &str, name: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO memory (key, value, updated_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at_ms = excluded.updated_at_ms",
            params![memory_key(namespace, name), value, now_epoch_ms()],
        )?;
        Ok(())
    }

    pub fn memory_get(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let conn = self.reader()?;
        let value = conn
            .query_row(
                "SELECT value FROM memory WHERE key = ?1",
                params![memory_key(namespace, name)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Entries of one namespace with the namespace prefix stripped, ordered by name.
    pub fn memory_list(&self, namespace: &str) -> Result<Vec<MemoryEntry>> {
        let prefix = format!("{namespace}:");
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT key, value, updated_at_ms
             FROM memory
             WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY key ASC",
        )?;
        let rows = stmt.query_map(params![prefix], |row| {
            let key: String = row.get(0)?;
            Ok(MemoryEntry {
                name: key[prefix.len()..].to_string(),
                value: row.get(1)?,
                updated_at_ms: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn memory_delete(&self, namespace: &str, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM memory WHERE key = ?1",
            params![memory_key(namespace, name)],
        )?;
        Ok(removed > 0)
    }
}

impl ApprovalLedger for MemoryStore {
    fn tool_status(&self, name: &str) -> Result<ApprovalStatus> {
        let Some(record) = self.get_tool_approval(name)? else {
            return Ok(ApprovalStatus::Pending);
        };
        ApprovalStatus::parse(&record.status)
            .ok_or_else(|| anyhow!("tool '{}' has unknown approval status '{}'", name, record.status))
    }

    fn set_tool_status(
        &self,
        name: &str,
        status: ApprovalStatus,
        actor: Option<&str>,
    ) -> Result<()> {
        let now_ms = now_epoch_ms();
        let approved_at = matches!(status, ApprovalStatus::Approved).then_some(now_ms);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tool_approvals (name, status, approved_by, approved_at_ms, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
               status = excluded.status,
               approved_by = excluded.approved_by,
               approved_at_ms = excluded.approved_at_ms",
            params![name, status.as_str(), actor, approved_at, now_ms],
        )
        .with_context(|| format!("failed to set tool '{}' to {}", name, status.as_str()))?;
        Ok(())
    }

    fn register_tool(&self, name: &str, description: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tool_approvals (name, status, description, created_at_ms)
             VALUES (?1, 'pending', ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET description = excluded.description",
            params![name, description, now_epoch_ms()],
        )?;
        Ok(())
    }
}

fn apply_migration(conn: &Connection, version: i64, name: &str, statements: &[&str]) -> Result<()> {
    let already: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
            params![version],
            |row| row.get(0),
        )
        .optional()?;
    if already.is_some() {
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    for statement in statements {
        if let Err(err) = tx.execute(statement, []) {
            // Statements are idempotent against older databases; tolerate duplicates.
            let message = err.to_string().to_lowercase();
            if !(message.contains("duplicate column") || message.contains("already exists")) {
                return Err(err).with_context(|| format!("migration {version} ({name}) failed"));
            }
        }
    }
    tx.execute(
        "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
        params![version, name],
    )?;
    tx.commit()?;
    tracing::debug!(version, name, "applied schema migration");
    Ok(())
}

fn memory_key(namespace: &str, name: &str) -> String {
    format!("{namespace}:{name}")
}

fn tool_approval_from_row(row: &Row<'_>) -> rusqlite::Result<ToolApprovalRecord> {
    Ok(ToolApprovalRecord {
        name: row.get(0)?,
        status: row.get(1)?,
        description: row.get(2)?,
        approved_by: row.get(3)?,
        approved_at_ms: row.get(4)?,
        created_at_ms: row.get(5)?,
    })
}

fn cron_job_from_row(row: &Row<'_>) -> rusqlite::Result<CronJobRecord> {
    Ok(CronJobRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        message: row.get(2)?,
        chat_id: row.get(3)?,
        schedule_type: row.get(4)?,
        schedule_value: row.get(5)?,
        enabled: row.get::<_, i64>(6)? != 0,
        next_run_at_ms: row.get(7)?,
        last_run_at_ms: row.get(8)?,
        last_status: row.get(9)?,
        last_error: row.get(10)?,
        created_at_ms: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn audit_rows_cannot_be_mutated_or_deleted() {
        let tmp = tempdir().expect("tempdir");
        let store = MemoryStore::open(&tmp.path().join("warden.db")).expect("open");
        store
            .append_audit(&NewAuditEntry {
                session_key: Some("cli:direct"),
                tool_name: "exec_cmd",
                arguments: r#"{"command":"ls"}"#,
                result: "ok",
                verdict: "allowed",
                reason: None,
            })
            .expect("append");

        let conn = store.conn().expect("conn");
        let update = conn.execute("UPDATE audit_log SET verdict = 'blocked'", []);
        assert!(update.is_err());
        let delete = conn.execute("DELETE FROM audit_log", []);
        assert!(delete.is_err());
    }

    #[test]
    fn reads_see_committed_rows_while_a_write_is_open() {
        let tmp = tempdir().expect("tempdir");
        let store = MemoryStore::open(&tmp.path().join("warden.db")).expect("open");
        store
            .add_message("cli:direct", Role::User, "first", None)
            .expect("add");

        let conn = store.conn().expect("conn");
        conn.execute_batch("BEGIN IMMEDIATE").expect("begin");
        conn.execute(
            "INSERT INTO messages (session_key, role, content, created_at_ms) VALUES ('cli:direct', 'user', 'pending', 0)",
            [],
        )
        .expect("insert");

        let history = store.get_history("cli:direct", 10).expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "first");

        conn.execute_batch("COMMIT").expect("commit");
        drop(conn);
        assert_eq!(store.get_history("cli:direct", 10).expect("history").len(), 2);
    }

    #[test]
    fn reopening_does_not_reapply_migrations() {
        let tmp = tempdir().expect("tempdir");
        let db = tmp.path().join("warden.db");
        drop(MemoryStore::open(&db).expect("first open"));
        let store = MemoryStore::open(&db).expect("second open");
        let conn = store.conn().expect("conn");
        let count: i64 = conn
            .query_row("SELECT COUNT(1) FROM schema_migrations", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 3);
    }
}
