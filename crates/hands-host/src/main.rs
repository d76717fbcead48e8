//! Remote-hands development host
//!
//! Runs the agent inside this process instead of an injected one, so a
//! controller can be exercised without a loader. Prints the channel names
//! and a few addresses worth poking at, then serves until stdin closes.

use anyhow::{Context, Result};
use clap::Parser;
use hands_agent::Agent;
use hands_common::{init_logging, AgentConfig, LogConfig};
use std::io::BufRead;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "hands-host")]
#[command(about = "Host the remote-hands agent in this process")]
#[command(version)]
struct Args {
    /// Agent config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Command channel prefix
    #[arg(long)]
    command_prefix: Option<String>,

    /// Data channel prefix
    #[arg(long)]
    data_prefix: Option<String>,

    /// Directory for the channel endpoints
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Bound on each remote call, in milliseconds
    #[arg(long)]
    remote_call_timeout_ms: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Sample callee for `CallFunction`.
extern "C" fn hands_host_add(a: usize, b: usize) -> usize {
    a.wrapping_add(b)
}

static GREETING: [u8; 16] = *b"hands-host ready";

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AgentConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AgentConfig::from_env().context("loading config from environment")?,
    };
    if let Some(prefix) = args.command_prefix {
        config.channel.command_prefix = prefix;
    }
    if let Some(prefix) = args.data_prefix {
        config.channel.data_prefix = prefix;
    }
    if let Some(dir) = args.socket_dir {
        config.channel.socket_dir = dir;
    }
    if args.remote_call_timeout_ms.is_some() {
        config.bridge.remote_call_timeout_ms = args.remote_call_timeout_ms;
    }

    let logging = if args.verbose {
        LogConfig::debug()
    } else {
        config.logging.clone()
    };
    init_logging(&logging);

    let handle = Agent::new(config).start().context("starting agent")?;

    println!("command channel: {}", handle.command_channel().endpoint_path().display());
    println!("data channel:    {}", handle.data_channel().endpoint_path().display());
    println!("pid:             {}", std::process::id());
    println!("add function:    {:#x}", hands_host_add as usize);
    println!("greeting bytes:  {:#x}", GREETING.as_ptr() as usize);
    println!("Close stdin to stop.");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        if line.is_err() {
            break;
        }
    }

    info!(target: "hands_host", "Stdin closed, shutting down");
    handle.shutdown();
    Ok(())
}
