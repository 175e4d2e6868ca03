use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;

use rdeploy::cli::DaemonOpts;
use rdeploy::config::DaemonConfig;
use rdeploy::journal::DeployJournal;
use rdeploy::logger::{Logger, TextLogger};
use rdeploy::server::DeployServer;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    let config = DaemonConfig::from_opts(&opts).context("Failed to load configuration")?;

    println!("Starting rdeploy agent:");
    println!("  Bind: {}", config.listen_addr);
    println!("  Progress interval: {} ms", config.rate_limit_ms);
    if config.strict_size {
        println!("  Size check: strict");
    }
    if let Some(ref j) = config.journal {
        println!("  Journal: {}", j.display());
    }

    if config.listen_addr.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the agent to all network interfaces");
        eprintln!("   The channel is unauthenticated; only use on trusted networks");
    }

    let logger: Arc<dyn Logger> = match config.log_file {
        Some(ref p) => Arc::new(
            TextLogger::new(p).with_context(|| format!("Failed to open log file {}", p.display()))?,
        ),
        None => Arc::new(TextLogger::stderr()),
    };

    let (stop_tx, mut stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted (Ctrl-C), stopping agent...");
        let _ = stop_tx.send(true);
    })
    .context("Failed to set Ctrl-C handler")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        let mut server = DeployServer::bind(&config.listen_addr, config.server_options())
            .await
            .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
        if let Some(ref path) = config.journal {
            server = server.with_journal(DeployJournal::new(path));
        }
        server.start(logger)?;

        while !*stop_rx.borrow() {
            if stop_rx.changed().await.is_err() {
                break;
            }
        }
        server.stop().await?;
        Ok::<(), anyhow::Error>(())
    })
}
