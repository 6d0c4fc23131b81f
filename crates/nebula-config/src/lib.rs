//! Configuration for the Nebula connection manager.
//!
//! Settings persist to disk as RON, tolerate missing and unknown fields, and
//! can be overridden from the command line via clap.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE, Config, ConnectionsConfig, DebugConfig, NetworkConfig, ReconnectStrategy,
};
pub use error::ConfigError;

/// Default per-user configuration directory (`<config_dir>/nebula`).
pub fn default_config_dir() -> Option<std::path::PathBuf> {
    dirs::config_dir().map(|d| d.join("nebula"))
}

/// Default per-user data directory (`<data_dir>/nebula`), where history lives.
pub fn default_data_dir() -> Option<std::path::PathBuf> {
    dirs::data_dir().map(|d| d.join("nebula"))
}
