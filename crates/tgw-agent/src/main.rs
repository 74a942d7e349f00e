// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TGW gateway agent.
//!
//! The long-running on-vehicle process: loads the provisioning file,
//! recovers the disk spool, wires the core, and drives the 100 ms
//! scheduler until a shutdown signal, then flushes RAM chains to disk
//! inside the grace period.
//!
//! # Usage
//!
//! ```bash
//! # Run against a provisioning file
//! tgw-agent --config /etc/tgw/gateway.json
//!
//! # Override the console port and enable storage diagnostics
//! tgw-agent --config gateway.json --console-port 4245 --debug 0x3
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tgw::sched::Scheduler;
use tgw::Gateway;

mod config_file;

#[derive(Parser, Debug)]
#[command(name = "tgw-agent")]
#[command(about = "TGW gateway agent - vehicular telematics core", long_about = None)]
struct Args {
    /// Provisioning file (JSON).
    #[arg(short, long)]
    config: PathBuf,

    /// Override the console TCP port (0 disables the console).
    #[arg(long)]
    console_port: Option<u16>,

    /// Override the spillover directory.
    #[arg(long)]
    spool_dir: Option<PathBuf>,

    /// Initial diagnostic category mask (hex).
    #[arg(long)]
    debug: Option<String>,

    /// Log filter (tracing env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() {
    let args = Args::parse();
    init_logging(&args.log);

    if let Err(e) = run(args) {
        tracing::error!("fatal: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(filter: &str) {
    // The core logs through the `log` facade; bridge it into tracing.
    let _ = tracing_log::LogTracer::init();
    let env_filter = tracing_subscriber::EnvFilter::try_new(filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn run(args: Args) -> anyhow::Result<()> {
    if let Some(mask) = &args.debug {
        let raw = mask.trim_start_matches("0x");
        let mask = u32::from_str_radix(raw, 16)
            .with_context(|| format!("invalid debug mask {:?}", args.debug))?;
        tgw::diag::set_debug_mask(mask);
    }

    let mut cfg = config_file::load(&args.config)?;
    if let Some(port) = args.console_port {
        cfg.console_port = port;
    }
    if let Some(dir) = args.spool_dir {
        cfg.storage.spool_dir = dir;
    }

    tracing::info!(
        "tgw-agent {} starting: {} sensors, {} interfaces",
        tgw::VERSION,
        cfg.sensors.len(),
        cfg.net.interfaces.len()
    );

    let mut gateway = Gateway::build(cfg).context("building gateway core")?;
    if gateway.console_port() != 0 {
        tracing::info!("console listening on port {}", gateway.console_port());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received");
            shutdown.store(true, Ordering::Release);
        })
        .context("installing signal handler")?;
    }

    Scheduler::new(shutdown).run(&mut gateway);
    tracing::info!("tgw-agent stopped");
    Ok(())
}
