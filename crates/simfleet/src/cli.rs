use std::path::PathBuf;

use clap::Parser;
use simfleet_core::FleetConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "simfleet", version, about = "Distributed simulation job scheduler")]
pub struct Cli {
    /// Fleet configuration file (default: `$XDG_CONFIG_HOME/simfleet/config.json`).
    #[arg(long, env = "SIMFLEET_CONFIG")]
    pub config: Option<PathBuf>,

    /// JSON catalog of servers, models, templates, jobs and archives
    /// (default: `$XDG_STATE_HOME/simfleet/catalog.json`).
    #[arg(long, env = "SIMFLEET_CATALOG")]
    pub catalog: Option<PathBuf>,

    /// Local directory holding `<model name>/<file>` inputs.
    #[arg(long, env = "SIMFLEET_DATA_ROOT")]
    pub data_root: Option<PathBuf>,

    /// Worker loop pacing in milliseconds.
    #[arg(long, env = "SIMFLEET_TICK_MS", value_parser = clap::value_parser!(u64).range(1..))]
    pub tick_ms: Option<u64>,

    /// Seconds between completion checks of a running simulation.
    #[arg(long, env = "SIMFLEET_POLL_SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_secs: Option<u64>,

    /// Write the resolved configuration back to the config file before starting.
    #[arg(long, default_value_t = false)]
    pub save_config: bool,

    /// Connect to every server and archive, print GPUs and disk usage, then exit.
    #[arg(long, default_value_t = false)]
    pub probe: bool,
}

impl Cli {
    /// Applies command-line overrides on top of the file configuration.
    pub fn apply(&self, cfg: &mut FleetConfig) {
        if let Some(dir) = &self.data_root {
            cfg.data_root = dir.clone();
        }
        if let Some(ms) = self.tick_ms {
            cfg.tick_ms = ms;
        }
        if let Some(secs) = self.poll_secs {
            cfg.poll_interval_secs = secs;
        }
    }
}
