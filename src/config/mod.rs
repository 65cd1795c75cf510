//! Typed configuration (§6, §10): a `Config` loaded from YAML via `serde`,
//! validated before being handed to the reactor supervisor, with CLI
//! overrides layered on top.

pub mod cli;
pub mod display;
pub mod types;
pub mod validate;

pub use cli::Cli;
pub use types::{Config, FastCgiConfig, RouteConfig, ServerConfig};
pub use validate::validate_configs;

use std::path::Path;

use crate::error::Result;
use crate::io::BackendKind;

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| crate::error::Error::Config(format!("reading {}: {e}", path.display())))?;
        let mut config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::Error::Config(format!("parsing {}: {e}", path.display())))?;
        config.servers = validate_configs(std::mem::take(&mut config.servers));
        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(workers) = cli.workers {
            self.worker_count = workers;
        }
        if cli.daemonize {
            self.daemonize = true;
        }
        if let Some(level) = &cli.log_level {
            self.log_level = level.clone();
        }
    }

    pub fn event_manager(&self) -> BackendKind {
        self.event_manager.parse().unwrap_or(BackendKind::Auto)
    }
}
