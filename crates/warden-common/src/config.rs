use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONFIG_DIR: &str = ".warden";
const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    pub workspace_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_level: String,
    /// Broad rules prepended to every system prompt.
    #[serde(default)]
    pub constitution_path: Option<PathBuf>,
    /// Directory of `*.md` laws appended after the constitution.
    #[serde(default)]
    pub laws_dir: Option<PathBuf>,
    /// Directory of `*.md` skill playbooks.
    #[serde(default)]
    pub skills_dir: Option<PathBuf>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProvider {
    OpenAi,
    #[default]
    Ollama,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: ModelProvider,
    pub model_id: String,
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ModelProvider::Ollama,
            model_id: "llama3.2:latest".to_string(),
            endpoint: Some("http://127.0.0.1:11434/v1".to_string()),
            api_key_env: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Number of prior messages loaded into each turn.
    #[serde(default = "default_memory_window")]
    pub memory_window: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            memory_window: default_memory_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: default_tick_secs(),
            min_interval_secs: default_min_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Approve the built-in tools at startup instead of leaving them pending.
    #[serde(default = "default_true")]
    pub auto_approve_builtin: bool,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            auto_approve_builtin: true,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl Default for WardenConfig {
    fn default() -> Self {
        let base = config_dir();
        Self {
            workspace_dir: base.join("workspace"),
            db_path: base.join("warden.db"),
            log_level: "info".to_string(),
            constitution_path: Some(base.join("constitution.md")),
            laws_dir: Some(base.join("laws")),
            skills_dir: Some(base.join("skills")),
            model: ModelConfig::default(),
            agent: AgentConfig::default(),
            scheduler: SchedulerConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_CONFIG_DIR)
}

fn default_true() -> bool {
    true
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout_secs() -> u64 {
    1800
}

fn default_max_iterations() -> usize {
    15
}

fn default_memory_window() -> usize {
    40
}

fn default_tick_secs() -> u64 {
    10
}

fn default_min_interval_secs() -> u64 {
    60
}

fn default_command_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize default config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("config has invalid value: {0}")]
    ValidationFailed(String),
}

impl WardenConfig {
    pub fn resolve_path() -> PathBuf {
        if let Ok(path) = env::var("WARDEN_CONFIG") {
            return PathBuf::from(path);
        }
        config_dir().join(DEFAULT_CONFIG_FILE)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw, path)
    }

    pub fn parse(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, raw).map_err(|source| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    pub fn load_or_create() -> Result<(Self, PathBuf, bool), ConfigError> {
        let path = Self::resolve_path();
        if path.exists() {
            let cfg = Self::load(&path)?;
            return Ok((cfg, path, false));
        }

        let cfg = Self::default();
        cfg.save(&path)?;
        Ok((cfg, path, true))
    }

    pub fn validate_and_prepare(&self) -> Result<(), ConfigError> {
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "log_level cannot be empty".to_string(),
            ));
        }
        if self.model.model_id.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "model.model_id cannot be empty".to_string(),
            ));
        }
        if let Some(endpoint) = &self.model.endpoint {
            if endpoint.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "model.endpoint cannot be empty if set".to_string(),
                ));
            }
        }
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationFailed(
                "agent.max_iterations must be at least 1".to_string(),
            ));
        }
        if self.scheduler.tick_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "scheduler.tick_secs must be at least 1".to_string(),
            ));
        }
        fs::create_dir_all(&self.workspace_dir).map_err(|source| ConfigError::WriteFailed {
            path: self.workspace_dir.clone(),
            source,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_file_fills_section_defaults() {
        let raw = r#"
workspace_dir = "/tmp/ws"
db_path = "/tmp/warden.db"
log_level = "debug"

[model]
model_id = "qwen2.5"
endpoint = "http://localhost:8080/v1"
"#;
        let cfg = WardenConfig::parse(raw, Path::new("inline.toml")).expect("parse");
        assert_eq!(cfg.model.model_id, "qwen2.5");
        assert_eq!(cfg.model.max_tokens, 4096);
        assert_eq!(cfg.agent.max_iterations, 15);
        assert_eq!(cfg.agent.memory_window, 40);
        assert_eq!(cfg.scheduler.tick_secs, 10);
        assert!(cfg.security.auto_approve_builtin);
        assert!(cfg.constitution_path.is_none());
    }

    #[test]
    fn save_then_load_keeps_values() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("nested").join("config.toml");
        let mut cfg = WardenConfig::default();
        cfg.agent.max_iterations = 7;
        cfg.save(&path).expect("save");
        let loaded = WardenConfig::load(&path).expect("load");
        assert_eq!(loaded.agent.max_iterations, 7);
    }

    #[test]
    fn validation_rejects_zero_iterations() {
        let tmp = tempdir().expect("tempdir");
        let mut cfg = WardenConfig::default();
        cfg.workspace_dir = tmp.path().join("ws");
        cfg.agent.max_iterations = 0;
        let err = cfg.validate_and_prepare().expect_err("should reject");
        assert!(err.to_string().contains("max_iterations"));
    }

    #[test]
    fn validation_creates_workspace() {
        let tmp = tempdir().expect("tempdir");
        let mut cfg = WardenConfig::default();
        cfg.workspace_dir = tmp.path().join("ws");
        cfg.validate_and_prepare().expect("valid");
        assert!(cfg.workspace_dir.is_dir());
    }

    #[test]
    fn malformed_file_reports_path() {
        let err = WardenConfig::parse("log_level = [", Path::new("bad.toml"))
            .expect_err("should fail");
        assert!(err.to_string().contains("bad.toml"));
    }
}
