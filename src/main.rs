use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio::sync::watch;

use rdeploy::cli::ClientOpts;
use rdeploy::client::{deploy, DeployConfig};
use rdeploy::progress::format_bytes;
use rdeploy::protocol::timeouts::CLOSE_GRACE_MS;

fn main() {
    if let Err(e) = run() {
        println!("ERROR: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let opts = ClientOpts::parse();
    let config = DeployConfig::from_opts(&opts)?;
    let quiet = !config.show_progress;

    // First Ctrl-C flips the flag and the deployer unwinds; a second one exits at once
    let (interrupt_tx, interrupt_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        if *interrupt_tx.borrow() {
            std::process::exit(130);
        }
        eprintln!("\nInterrupted by user (Ctrl-C), closing connection...");
        interrupt_tx.send_replace(true);
    })
    .context("Failed to set Ctrl-C handler")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    if !quiet {
        println!("Deploying {} to {}", config.source.display(), config.server);
        for d in &config.destinations {
            println!("  -> {}", d);
        }
    }

    let result = rt.block_on(deploy(config, interrupt_rx));
    // Do not wait on blocking work that an interrupt left behind
    rt.shutdown_timeout(Duration::from_millis(CLOSE_GRACE_MS));
    let report = result.context("deployment failed")?;

    if !quiet {
        println!(
            "{} ({} items) deployed to {} destination(s) in {:.2}s",
            format_bytes(report.byte_size),
            report.item_count,
            report.completed.len(),
            report.elapsed.as_secs_f64()
        );
    }
    if !report.is_success() {
        anyhow::bail!("{} destination(s) reported errors", report.errors.len());
    }
    Ok(())
}
