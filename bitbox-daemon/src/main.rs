use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::info;

use bitbox_daemon::{ConfigWatcher, Daemon};

#[derive(Parser)]
#[command(name = "bitbox-daemon")]
#[command(about = "Peer-to-peer directory synchronization daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration properties file
    #[arg(short, long, default_value = "configuration.properties")]
    config: PathBuf,

    /// Directory to watch and synchronize
    #[arg(short, long, default_value = "share")]
    share: PathBuf,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let watcher = ConfigWatcher::start(cli.config)?;
    let daemon = Daemon::new(watcher.subscribe(), cli.share);

    daemon
        .run(async {
            let _ = signal::ctrl_c().await;
            info!("interrupt received");
        })
        .await?;
    Ok(())
}
