//! Update daemon for the desktop installer pipeline
//!
//! Runs a single update attempt, or verifies a staged installer by hand.

use anyhow::Context;
use clap::{Parser, Subcommand};
use reqwest::Url;
use signed_updater::{
    verify, EventSink, TrustAnchor, UpdateController, UpdateEligibility, UpdateRequest,
    UpdaterConfig,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, EnvFilter};

/// Command-line arguments for the update daemon
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download, verify and launch the installer for a version
    Update {
        /// Version directory on the builds server
        #[arg(required = true)]
        version: String,

        /// JSON config file
        #[arg(short, long, required_unless_present = "builds_base")]
        config: Option<PathBuf>,

        /// Builds server root; overrides the config file
        #[arg(long)]
        builds_base: Option<Url>,

        /// Override the staging slot
        #[arg(long)]
        staging: Option<PathBuf>,

        /// Treat auto-update as switched off
        #[arg(long, default_value_t = false)]
        no_auto_update: bool,

        /// Treat the host as running in safe mode
        #[arg(long, default_value_t = false)]
        safemode: bool,
    },

    /// Check a file against its detached signature with the embedded key
    Verify {
        file: PathBuf,
        signature: PathBuf,
    },

    /// Print the key ids of the embedded publisher certificate
    Fingerprint,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug,signed_updater=debug")
    } else {
        EnvFilter::new("info,signed_updater=info")
    };
    // stdout carries machine-readable output.
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Update {
            version,
            config,
            builds_base,
            staging,
            no_auto_update,
            safemode,
        } => {
            let mut config = match (config, builds_base) {
                (Some(path), base) => {
                    let mut config = UpdaterConfig::from_json_file(&path)?;
                    if let Some(base) = base {
                        config.builds_base = base;
                    }
                    config
                }
                (None, Some(base)) => UpdaterConfig::new(base),
                (None, None) => anyhow::bail!("either --config or --builds-base is required"),
            };
            if let Some(staging) = staging {
                config = config.staging_path(staging);
            }
            let eligibility = UpdateEligibility {
                updates_enabled: !no_auto_update,
                safe_mode: safemode,
            };
            run_update(config, eligibility, version).await
        }
        Commands::Verify { file, signature } => verify_files(file, signature),
        Commands::Fingerprint => {
            let anchor = TrustAnchor::embedded()?;
            for key_id in anchor.key_ids() {
                let allowed = if anchor.is_allowed(&key_id) {
                    "allowed"
                } else {
                    "known"
                };
                println!("{key_id} {allowed}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_update(
    config: UpdaterConfig,
    eligibility: UpdateEligibility,
    version: String,
) -> anyhow::Result<ExitCode> {
    let (events, mut rx) = EventSink::channel();
    let controller = UpdateController::builder(config)
        .events(events)
        .eligibility(eligibility)
        .build()?;

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::error!(%err, "failed to encode event"),
            }
        }
    });

    let cancel = controller.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling update");
            cancel.cancel();
        }
    });

    let result = controller.request_update(UpdateRequest::new(version)).await;
    drop(controller);
    printer.await.context("event printer task panicked")?;

    match result {
        Ok(outcome) => {
            tracing::info!(path = %outcome.installer_path.display(), "installer launched, exiting");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            tracing::error!(kind = ?err.kind(), "update failed: {err}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn verify_files(file: PathBuf, signature: PathBuf) -> anyhow::Result<ExitCode> {
    let anchor = TrustAnchor::embedded()?;
    let message =
        std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
    let blob =
        std::fs::read(&signature).with_context(|| format!("reading {}", signature.display()))?;

    let verdict = verify(&message, &blob, &anchor);
    println!("{}", serde_json::to_string(&verdict)?);
    Ok(if verdict.verified {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
