// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! PDF Sign Service
//!
//! Runs the configured HTTP and directory-watcher services, or signs and
//! verifies documents once from the command line.
//!
//! # Commands
//!
//! - `serve`: run every service in the configuration file
//! - `sign`: sign the given files with one signer and write them to a directory
//! - `verify`: verify the given files and print the reports as JSON

mod api;
mod flags;
mod service;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use pdfsign_core::{config::ServiceConfig, protocol::JobStatusResponse, VERIFY_UNIT};
use service::Runtime;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "pdfsign.yaml";

#[derive(Parser, Debug)]
#[command(name = "pdfsign", version)]
#[command(about = "PDF Sign Service - Multi-tenant PDF signing and verification", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML, JSON or TOML)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG, env = "PDFSIGN_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Re-verify every signed document, overriding validateSignature
    #[arg(long, global = true)]
    validate_signature: Option<bool>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Run every configured service
    Serve,

    /// Sign files once and exit
    Sign {
        /// Signer to use; may be omitted when only one is configured
        #[arg(short, long)]
        signer: Option<String>,

        /// Directory receiving the signed files
        #[arg(short, long, default_value = "signed")]
        out: PathBuf,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Verify files and print the reports
    Verify {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    // The override flags depend on the signers, so the configuration is read
    // before the full command line is parsed
    let config_path = flags::config_path(&args)
        .or_else(|| std::env::var_os("PDFSIGN_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let loaded = ServiceConfig::load(&config_path);
    let signers: Vec<String> = match &loaded {
        Ok(config) => config.signers.keys().cloned().collect(),
        Err(_) => Vec::new(),
    };

    let matches = Cli::command()
        .mut_subcommand("serve", |c| flags::add_signer_flags(c, &signers))
        .mut_subcommand("sign", |c| flags::add_signer_flags(c, &signers))
        .get_matches_from(&args);
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    init_tracing(&cli.log_level);
    info!("PDF Sign Service v{}", pdfsign_core::VERSION);

    let mut config = loaded
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some((_, sub)) = matches.subcommand() {
        let qualified = signers.len() > 1;
        for signer in &signers {
            if let Some(overrides) = flags::overrides_for(sub, signer, qualified) {
                config
                    .apply_overrides(signer, &overrides)
                    .context("Invalid signer override")?;
            }
        }
    }

    let runtime = Runtime::build(config, cli.validate_signature)?;
    let result = match cli.action {
        Action::Serve => runtime.serve(wait_for_shutdown()).await,
        Action::Sign { signer, out, files } => {
            let signer = match signer {
                Some(signer) => signer,
                None => only_signer(&signers)?,
            };
            sign_files(&runtime, &signer, &files, &out).await
        }
        Action::Verify { files } => verify_files(&runtime, &files).await,
    };

    if let Err(e) = &result {
        error!(error = %format!("{:#}", e), "Exiting with error");
    }
    result
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .json()
        .init();
}

fn only_signer(signers: &[String]) -> Result<String> {
    match signers {
        [signer] => Ok(signer.clone()),
        [] => bail!("no signer configured"),
        _ => bail!("several signers configured, choose one with --signer"),
    }
}

async fn sign_files(runtime: &Runtime, signer: &str, files: &[PathBuf], out: &std::path::Path) -> Result<()> {
    let job = runtime.run_job(signer, files).await?;
    let failed = runtime.deliver(&job, out)?;
    if failed > 0 {
        bail!("{} of {} documents could not be signed", failed, job.tasks.len());
    }
    Ok(())
}

async fn verify_files(runtime: &Runtime, files: &[PathBuf]) -> Result<()> {
    let job = runtime.run_job(VERIFY_UNIT, files).await?;
    let mut tasks: Vec<_> = job.tasks.values().cloned().collect();
    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    let report = JobStatusResponse::new(&job, tasks);
    println!("{}", serde_json::to_string_pretty(&report)?);

    let failed = report.tasks.iter().filter(|t| !t.error.is_empty()).count();
    runtime.discard(&job)?;
    if failed > 0 {
        bail!("{} of {} documents failed verification", failed, report.tasks.len());
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
#[cfg(unix)]
async fn wait_for_shutdown() {
    use futures::stream::StreamExt;
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "Failed to register signal handlers");
            return std::future::pending().await;
        }
    };

    if let Some(signal) = signals.next().await {
        info!(signal, "Received signal");
    }
}

/// Resolves on Ctrl+C
#[cfg(windows)]
async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
