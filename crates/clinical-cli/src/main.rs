//! `clinical-server` binary entry point.
//!
//! Loads [`Config`], initializes tracing, wires the `clinical-core`
//! subsystems behind demonstration collaborators (echo LLM, permissive
//! validator, fixed-vector embedding client), builds the axum router, and
//! serves it until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use clinical_core::compose::{
    DefaultBeautifyPromptComposer, EchoLlmClient, NoOfflineBeautifier, PermissiveValidator,
    Pipeline,
};
use clinical_core::config::Config;
use clinical_server::state::AppState;

/// Clinical encounter-note orchestration server.
#[derive(Parser)]
#[command(name = "clinical-server", version, about)]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Host address to bind to. Use 0.0.0.0 for LAN access.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Path to a TOML configuration file overriding the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    tracing::info!(
        host = %cli.host,
        port = cli.port,
        scrub_mode = ?config.phi_scrub_mode,
        "starting clinical orchestration server"
    );

    // Demonstration collaborators: a real deployment injects a provider
    // backed by a remote LLM transport instead.
    let pipeline = Arc::new(Pipeline::new(
        Box::new(EchoLlmClient),
        Box::new(NoOfflineBeautifier),
        Box::new(DefaultBeautifyPromptComposer),
        Box::new(PermissiveValidator),
    ));

    let min_interval = Duration::from_millis(config.streams.min_interval_ms);
    let state = Arc::new(AppState::new(pipeline, min_interval));

    let router = clinical_server::build_router(state);

    if cli.host == "0.0.0.0" {
        tracing::warn!("binding to 0.0.0.0 — server accessible from the LAN");
    }

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", cli.host, cli.port))
        .await
        .with_context(|| format!("binding to {}:{}", cli.host, cli.port))?;
    tracing::info!("listening on http://{}:{}", cli.host, cli.port);

    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

/// Wait for an OS shutdown signal (Ctrl+C or SIGTERM).
///
/// On Unix, listens for both Ctrl+C and SIGTERM. On other platforms, listens
/// for Ctrl+C only.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler, using Ctrl+C only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for Ctrl+C");
                } else {
                    tracing::info!("received Ctrl+C");
                }
                return;
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Ctrl+C handler error");
                } else {
                    tracing::info!("received Ctrl+C");
                }
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
        } else {
            tracing::info!("received Ctrl+C");
        }
    }
}
