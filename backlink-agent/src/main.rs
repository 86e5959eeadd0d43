mod connection;
mod socks;

use std::path::PathBuf;

use anyhow::Result;
use backlink_common::logging::init_logging;
use clap::Parser;

use crate::connection::AgentOptions;

#[derive(Debug, Parser)]
#[command(
    name = "backlink-agent",
    about = "Dial out to a backlink relay and stay reachable through it"
)]
struct Cli {
    /// Relay address as host:port
    destination: String,

    /// Pin the relay host key by its SHA-256 fingerprint
    #[arg(long)]
    fingerprint: Option<String>,

    /// OpenSSH private key to authenticate with; an ephemeral key is
    /// generated when absent
    #[arg(long)]
    key: Option<PathBuf>,

    /// Username presented to the relay
    #[arg(long, env = "USER", default_value = "agent")]
    user: String,

    /// Local SOCKS5 proxy port; 0 leaves the frontend off
    #[arg(long, default_value_t = 0)]
    socks: u16,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,
}

/// Baked in at build time so a distributed binary can carry its SOCKS
/// port without any flags.
const EMBEDDED_SOCKS_PORT: Option<&str> = option_env!("BACKLINK_SOCKS_PORT");

/// Flag, then build-time embed, then environment; first non-zero wins.
fn resolve_socks_port(flag: u16, embedded: Option<&str>, env: Option<String>) -> u16 {
    if flag != 0 {
        return flag;
    }
    for candidate in [embedded, env.as_deref()] {
        if let Some(port) = candidate.and_then(|v| v.trim().parse::<u16>().ok()) {
            if port != 0 {
                return port;
            }
        }
    }
    0
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug)?;

    let socks_port = resolve_socks_port(
        cli.socks,
        EMBEDDED_SOCKS_PORT,
        std::env::var("SOCKS_PORT").ok(),
    );

    connection::run(AgentOptions {
        destination: cli.destination,
        username: cli.user,
        fingerprint: cli.fingerprint,
        key_path: cli.key,
        socks_port,
    })
    .await
}
