//! Tracing subscriber setup for the command line.

use tracing_subscriber::EnvFilter;

use crate::ports::config_port::ConfigPort;

pub const DEFAULT_LEVEL: &str = "warn";

/// Pick the log level: command-line flag, then `[logging] level`, then the
/// default.
pub fn resolve_level(flag: Option<&str>, config: Option<&dyn ConfigPort>) -> String {
    flag.map(str::to_string)
        .or_else(|| config.and_then(|c| c.get_string("logging", "level")))
        .unwrap_or_else(|| DEFAULT_LEVEL.to_string())
        .to_lowercase()
}

/// Install a stderr subscriber. `RUST_LOG` overrides `level`. A second call
/// leaves the first subscriber in place.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
