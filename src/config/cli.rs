//! Command-line overrides layered on top of the YAML config (§10).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "elements-server", about = "Reactor-based HTTP/FastCGI server")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Override `worker_count` from the config file.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Fork into the background after startup.
    #[arg(short = 'd', long)]
    pub daemonize: bool,

    /// Override `log_level` from the config file.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Validate the configuration and print the dashboard without starting
    /// the reactor.
    #[arg(long)]
    pub check: bool,
}
