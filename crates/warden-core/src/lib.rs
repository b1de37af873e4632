use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

pub mod model;
pub mod schedule;

pub use model::{ChatMessage, ModelClient, ModelResponse, ToolCall, ToolDefinition};
pub use schedule::{Schedule, ScheduleError, ScheduleType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// Outcome of a policy pre-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        if self.allowed { "allowed" } else { "blocked" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Banned,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Banned => "banned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "banned" => Some(Self::Banned),
            _ => None,
        }
    }
}

/// Externally-owned approval state consulted on every policy check.
///
/// Implementations must not cache: a status written through `set_tool_status` has to be
/// visible to the very next `tool_status` call.
pub trait ApprovalLedger: Send + Sync {
    /// Status of `name`; tools the ledger has never seen are pending.
    fn tool_status(&self, name: &str) -> Result<ApprovalStatus>;

    fn set_tool_status(
        &self,
        name: &str,
        status: ApprovalStatus,
        actor: Option<&str>,
    ) -> Result<()>;

    /// Records `name` as pending if it is not known yet. Existing rows keep their status.
    fn register_tool(&self, name: &str, description: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Ok,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

pub fn now_epoch_ms() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_millis() as i64
}

/// Cuts `text` to at most `max_chars` characters, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_str() {
        for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("narrator"), None);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 50), "short");
    }

    #[test]
    fn verdict_labels_match_audit_vocabulary() {
        assert_eq!(Verdict::allow().as_str(), "allowed");
        assert_eq!(Verdict::block("nope").as_str(), "blocked");
    }
}
