//! Clap argument structs for the client and the agent

use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::protocol::{timeouts::PROGRESS_TICK_MS, DEFAULT_CHUNK_SIZE};

/// Deploy a local directory to one or more paths on a remote agent
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct ClientOpts {
    /// Address of remote agent: <domain or ip>[:port]
    #[arg(long)]
    pub addr: String,

    /// Folder to deploy
    #[arg(long)]
    pub src: PathBuf,

    /// Destination on the agent host; repeat for several (one is required)
    #[arg(long = "dst", action = ArgAction::Append, required = true)]
    pub destinations: Vec<String>,

    /// Size of each data frame in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Minimum interval between progress redraws
    #[arg(long, default_value_t = PROGRESS_TICK_MS)]
    pub rate_limit_ms: u64,

    /// Only print errors
    #[arg(short, long)]
    pub quiet: bool,
}

/// Deployment agent options
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Receive directory deployments and unpack them")]
pub struct DaemonOpts {
    /// Listen address (host:port) [default: localhost:8081]
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Interval between progress messages sent to clients
    #[arg(long)]
    pub rate_limit_ms: Option<u64>,

    /// Refuse to extract when received bytes differ from the declared size
    #[arg(long)]
    pub strict_size: bool,

    /// Write event log lines to this file instead of stderr
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Append a JSON line per destination outcome to this file
    #[arg(long)]
    pub journal: Option<PathBuf>,
}
