use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ntrip-bridge",
    version,
    about = "WebSocket bridge between browser GNSS clients and NTRIP casters"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "ntrip-bridge.yaml")]
    pub config: PathBuf,

    /// Listen address (overrides config file setting)
    #[arg(long)]
    pub listen: Option<String>,

    /// Listen port, keeping the configured host (overrides config file setting)
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Log level or filter directive (overrides config file setting)
    #[arg(long)]
    pub log_level: Option<String>,
}
