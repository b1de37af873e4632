//! Tracing setup for the `warden` binary. Diagnostics go to stderr so replies on stdout stay
//! pipeable.

use tracing_subscriber::EnvFilter;

/// HTTP and TLS internals stay at warn unless `RUST_LOG` asks otherwise.
const QUIET_DEPENDENCIES: &str = "hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn";

/// Installs the global subscriber. `RUST_LOG` overrides the configured level; a second call
/// is a no-op.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| configured_filter(log_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn configured_filter(log_level: &str) -> EnvFilter {
    let level = log_level.trim();
    let level = if level.is_empty() { "info" } else { level };
    EnvFilter::try_new(format!("{level},{QUIET_DEPENDENCIES}"))
        .unwrap_or_else(|_| EnvFilter::new(format!("info,{QUIET_DEPENDENCIES}")))
}
