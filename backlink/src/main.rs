use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use backlink_common::helpers::fs::ensure_secure_directory;
use backlink_common::logging::init_logging;
use backlink_core::{install_watch_log, RelayConfig, Services};
use backlink_protocol_ssh::run_server;
use clap::Parser;
use tracing::*;

#[derive(Debug, Parser)]
#[command(
    name = "backlink",
    about = "Reverse-SSH relay: agents dial in, operators reach them"
)]
struct Cli {
    /// Address to accept SSH connections on
    #[arg(long, default_value = "0.0.0.0:2222")]
    listen: SocketAddr,

    /// Directory holding key stores, the host key and watch.log
    #[arg(long, env = "BACKLINK_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Keepalive period in seconds; 0 disables keepalives and idle
    /// deadlines
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Register any unknown key as a controllable agent
    #[arg(long)]
    insecure: bool,

    /// Accept any unknown key for the proxy role
    #[arg(long)]
    open_proxy: bool,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug)?;

    let config = RelayConfig {
        data_dir: cli.data_dir,
        timeout: cli.timeout,
        insecure: cli.insecure,
        open_proxy: cli.open_proxy,
    };

    ensure_secure_directory(&config.data_dir)
        .with_context(|| format!("preparing {}", config.data_dir.display()))?;
    ensure_secure_directory(config.downloads_dir()).context("preparing downloads directory")?;
    ensure_secure_directory(config.user_keys_dir()).context("preparing user keys directory")?;

    if config.insecure {
        warn!("Running insecure: unknown keys will be accepted as agents");
    }

    let services = Services::new(config);
    install_watch_log(
        &services.connection_events,
        services.config.watch_log_path(),
    )
    .await;

    run_server(services, cli.listen).await
}
