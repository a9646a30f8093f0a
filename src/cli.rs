use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "api-recorder", about = "Recording HTTP proxy for offline API development")]
pub struct Cli {
    /// Path to the runtime configuration file (defaults to ./api-recorder.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to bind the local listener on, e.g. 127.0.0.1:8080.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Hostname of the upstream service that cache misses are forwarded to.
    #[arg(long)]
    pub upstream_host: Option<String>,

    /// Port of the upstream service.
    #[arg(long)]
    pub upstream_port: Option<u16>,

    /// Directory holding recorded responses.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Forward every request upstream without reading or writing recordings.
    #[arg(long)]
    pub pass_through: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
