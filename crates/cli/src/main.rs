//! issue-tally entry point.
//!
//! This binary is the composition root for the entire system:
//!
//! 1. **Load configuration**: `.env` via `dotenvy`, then flags with
//!    environment fallbacks via `clap`.
//! 2. **Wire observability**: `tracing-subscriber` (pretty or JSON) and, when
//!    `OTEL_EXPORTER_OTLP_ENDPOINT` is set, an OpenTelemetry OTLP exporter.
//! 3. **Construct infrastructure**: the [`github::GithubClient`] and the
//!    [`storage::RedbRecordStore`], injected into an [`orchestrator::Driver`].
//! 4. **Select mode**:
//!    - `run --org <org>`: execute one run and print its report as JSON.
//!      Exit status is `0` for success, `2` for partial success, `1` for failure.
//!    - `serve`: expose the HTTP trigger surface until SIGINT/SIGTERM.

mod args;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use github::GithubClient;
use orchestrator::{Driver, RunRegistry, RunRequest};
use pipeline::{OrganizationName, RunOutcome};
use storage::RedbRecordStore;
use tokio_util::sync::CancellationToken;

use crate::args::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let telemetry = telemetry::init(cli.log_format)?;

    let result = execute(cli).await;
    telemetry.shutdown();
    result
}

async fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let driver = build_driver(&cli)?;

    match cli.command {
        Command::Run { org } => {
            let organization =
                OrganizationName::new(org).context(OrganizationName::REQUIREMENTS)?;
            run_once(driver, organization).await
        }
        Command::Serve {
            host,
            port,
            max_finished_runs,
        } => {
            let listener = tokio::net::TcpListener::bind((host.as_str(), port))
                .await
                .with_context(|| format!("Failed to bind {host}:{port}"))?;
            let registry = RunRegistry::new(Arc::new(driver)).with_retention(max_finished_runs);
            listener::serve(listener, registry, shutdown_signal()).await?;
            tracing::info!("Graceful shutdown complete");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_driver(cli: &Cli) -> anyhow::Result<Driver> {
    let config = cli.orchestrator.to_config();

    let client = GithubClient::new(cli.github.to_config(config.call_timeout))
        .context("Failed to construct GitHub client")?;
    let store = RedbRecordStore::open(&cli.db)
        .with_context(|| format!("Failed to open record store at {}", cli.db.display()))?;
    tracing::info!(
        api_url = client.api_url(),
        db = %cli.db.display(),
        concurrency = config.concurrency_limit,
        "Loaded configuration"
    );

    let driver = Driver::new(Arc::new(client), Arc::new(store), &config)?;
    Ok(driver)
}

async fn run_once(driver: Driver, organization: OrganizationName) -> anyhow::Result<ExitCode> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });

    let report = driver
        .run(RunRequest::new(organization).with_cancellation(cancel))
        .await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(match report.outcome {
        RunOutcome::Success => ExitCode::SUCCESS,
        RunOutcome::PartialSuccess => ExitCode::from(2),
        RunOutcome::Failed => ExitCode::FAILURE,
    })
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C)"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}
