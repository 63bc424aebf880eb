mod chunk;
mod config;
mod engine;
mod error;
mod mode_switch;
mod package;
mod progress;
mod protocol;
mod transport;
mod transport_btleplug;
#[cfg(test)]
mod transport_mock;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use btleplug::api::BDAddr;
use clap::Parser;
use tracing::{debug, error, info, warn};

use crate::config::DfuConfig;
use crate::engine::DfuUpdater;
use crate::mode_switch::SwitchMethod;
use crate::package::{PackageFile, PackageSource};
use crate::progress::ProgressBarSink;
use crate::transport_btleplug::DfuTransportBtleplug;

/// Update firmware on nRF Secure DFU targets over BLE
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// BLE DFU target name
    #[arg(short, long)]
    name: Option<String>,

    /// BLE Address
    #[arg(short, long)]
    addr: Option<String>,

    /// Firmware update package path (.zip, or a bare .bin image)
    #[arg(short, long)]
    pkg: PathBuf,

    /// TOML file overriding transfer pacing
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Switch the application into the bootloader before updating
    #[arg(long, value_enum)]
    switch: Option<SwitchMethod>,

    /// Name advertised by the bootloader after a mode switch
    #[arg(long, default_value = "DfuTarg")]
    bootloader_name: String,

    /// Seconds to scan for a target
    #[arg(long, default_value_t = 30)]
    scan_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install log subscriber: {}", e);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    anyhow::ensure!(
        args.name.is_some() || args.addr.is_some(),
        "either --name or --addr is required"
    );
    let config = match &args.config {
        Some(path) => DfuConfig::load_from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => DfuConfig::default(),
    };
    let package = PackageFile::new(&args.pkg)
        .load()
        .with_context(|| format!("loading {}", args.pkg.display()))?;
    let addr = args
        .addr
        .as_deref()
        .map(str::parse::<BDAddr>)
        .transpose()
        .context("parsing --addr")?;
    let scan_timeout = Duration::from_secs(args.scan_timeout);

    let mut transport = DfuTransportBtleplug::new(args.name.as_deref(), addr, scan_timeout).await?;
    if let Some(method) = args.switch {
        mode_switch::enter_bootloader(&transport, method, config.response_timeout()).await?;
        if let Err(e) = transport.disconnect().await {
            debug!(error = %e, "Disconnect after mode switch failed");
        }
        transport = DfuTransportBtleplug::new(Some(&args.bootloader_name), None, scan_timeout).await?;
    }

    let updater = DfuUpdater::new(config);
    let cancel = updater.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current write");
            cancel.cancel();
        }
    });

    info!(
        image = package.image_data.len(),
        object = updater.config().max_object_size,
        "Started DFU upload"
    );
    let sink = ProgressBarSink::new();
    let result = updater.run(&transport, &package, &sink).await;
    if let Err(e) = transport.disconnect().await {
        warn!(error = %e, "Disconnect failed");
    }
    result?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Err(e) = run(args).await {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
