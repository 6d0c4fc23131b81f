//! Structured logging and tracing for the Nebula connection manager.
//!
//! Sets up span-based, filterable logging via the `tracing` ecosystem:
//! console output with uptime timestamps and module paths, plus an optional
//! JSON file for post-mortem analysis of connection failures. The level comes
//! from `RUST_LOG` when set, otherwise from the config's `debug.log_level`.

use nebula_config::Config;
use std::path::Path;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Third-party crates whose chatter is held at `warn`.
const QUIET_DEPENDENCIES: &str = "hyper=warn,hyper_util=warn,reqwest=warn,tungstenite=warn,tokio_tungstenite=warn";

/// File the JSON layer writes to inside `log_dir`.
pub const LOG_FILE_NAME: &str = "netmon.log";

/// Build the filter string for `level`, keeping noisy dependencies quiet.
pub fn filter_directives(level: &str) -> String {
    let level = if level.is_empty() { "info" } else { level };
    format!("{level},{QUIET_DEPENDENCIES}")
}

/// Initialize the global tracing subscriber.
///
/// * `log_dir` - Directory for the JSON log file
/// * `file_logging` - Whether to write the JSON log file at all
/// * `config` - Optional configuration providing the log level
///
/// # Examples
///
/// ```no_run
/// use nebula_log::init_logging;
/// use nebula_config::Config;
///
/// // Console only, default level
/// init_logging(None, false, None);
///
/// // Console plus JSON file, level from config
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), true, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, file_logging: bool, config: Option<&Config>) {
    let level = config.map(|c| c.debug.log_level.as_str()).unwrap_or("info");
    let filter_str = filter_directives(level);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if file_logging
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        // A second init (tests, embedding) is not an error worth surfacing.
        let _ = subscriber.with(file_layer).try_init();
        return;
    }

    let _ = subscriber.try_init();
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(filter_directives("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        let filter_str = format!("{}", default_env_filter());
        assert!(filter_str.contains("info"));
        assert!(filter_str.contains("tungstenite=warn"));
        assert!(filter_str.contains("reqwest=warn"));
    }

    #[test]
    fn test_empty_level_falls_back_to_info() {
        assert!(filter_directives("").starts_with("info,"));
    }

    #[test]
    fn test_config_level_used() {
        let mut config = Config::default();
        config.debug.log_level = "nebula_connections=trace".to_string();
        let directives = filter_directives(&config.debug.log_level);
        assert!(directives.starts_with("nebula_connections=trace,"));
    }

    #[test]
    fn test_env_filter_parsing() {
        let valid_filters = [
            "info",
            "debug,nebula_net=trace",
            "warn,nebula_connections=debug,nebula_net=trace",
            "error",
        ];

        for filter_str in &valid_filters {
            let result = EnvFilter::try_from(filter_directives(filter_str));
            assert!(result.is_ok(), "Failed to parse filter: {}", filter_str);
        }
    }

    #[test]
    fn test_file_logging_creates_log_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_dir = temp_dir.path().join("logs");

        init_logging(Some(&log_dir), true, None);
        tracing::info!("file logging smoke test");

        assert!(log_dir.join(LOG_FILE_NAME).exists());
    }
}
