//! Command-line argument parsing for the connection monitor.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Nebula connection monitor command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "netmon", about = "Nebula world connection monitor")]
pub struct CliArgs {
    /// World to connect to, as `name=url` (repeatable).
    #[arg(long = "world", value_name = "NAME=URL")]
    pub worlds: Vec<String>,

    /// Seconds of inactivity before a connection is considered stale.
    #[arg(long)]
    pub stale_threshold: Option<u64>,

    /// Request timeout in seconds.
    #[arg(long)]
    pub request_timeout: Option<u64>,

    /// Seconds between printed reports.
    #[arg(long, default_value_t = 30)]
    pub report_interval: u64,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path to data directory holding connection history.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

impl CliArgs {
    /// Split every `--world name=url` argument. Malformed entries are returned
    /// as errors naming the offending argument.
    pub fn parsed_worlds(&self) -> Result<Vec<(String, String)>, String> {
        self.worlds
            .iter()
            .map(|raw| match raw.split_once('=') {
                Some((name, url)) if !name.is_empty() && !url.is_empty() => {
                    Ok((name.to_string(), url.to_string()))
                }
                _ => Err(format!("expected NAME=URL, got '{raw}'")),
            })
            .collect()
    }
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(secs) = args.stale_threshold {
            self.connections.stale_threshold_secs = secs;
        }
        if let Some(secs) = args.request_timeout {
            self.network.request_timeout_secs = secs;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("netmon").chain(list.iter().copied()))
    }

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        config.apply_cli_overrides(&args(&["--stale-threshold", "60", "--log-level", "debug"]));
        assert_eq!(config.connections.stale_threshold_secs, 60);
        assert_eq!(config.debug.log_level, "debug");
        // Non-overridden fields retain defaults
        assert_eq!(config.network.request_timeout_secs, 30);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&args(&[]));
        assert_eq!(config, original);
    }

    #[test]
    fn test_worlds_parsed() {
        let cli = args(&["--world", "Alpha=ws://a:1", "--world", "Beta=http://b/login"]);
        let worlds = cli.parsed_worlds().unwrap();
        assert_eq!(
            worlds,
            vec![
                ("Alpha".to_string(), "ws://a:1".to_string()),
                ("Beta".to_string(), "http://b/login".to_string()),
            ]
        );
        assert_eq!(cli.report_interval, 30);
    }

    #[test]
    fn test_malformed_world_rejected() {
        let cli = args(&["--world", "no-separator"]);
        assert!(cli.parsed_worlds().is_err());
    }
}
