pub mod config;
pub mod logging;
pub mod path_guard;

pub const APP_NAME: &str = "Warden";

pub use config::{
    AgentConfig, ModelConfig, ModelProvider, SchedulerConfig, SecurityConfig, WardenConfig,
};
