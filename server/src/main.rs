//! `severity-server` entry point.
//!
//! Resolves configuration, installs logging, loads the model artifacts
//! once and serves HTTP until Ctrl+C or SIGTERM.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use severity_core::config_loader::PartialConfig;
use severity_core::{ConfigLoader, Predictor, load_artifacts};
use severity_server::AppState;
use severity_server::logging::init_logging;
use tokio::net::TcpListener;

#[derive(Debug, Parser)]
#[command(
    name = "severity-server",
    version,
    about = "Serve crash severity predictions over HTTP"
)]
struct Cli {
    /// TOML config file. Defaults to `$SEVERITY_HOME/config.toml`.
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding both artifact bundles.
    #[arg(long, value_name = "DIR")]
    model_dir: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    system_file: Option<String>,

    #[arg(long, value_name = "FILE")]
    artifacts_file: Option<String>,

    /// Listen address, e.g. `0.0.0.0:5000`.
    #[arg(long, short = 'b', value_name = "ADDR")]
    bind: Option<String>,

    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Tracing filter directive; `RUST_LOG` takes precedence.
    #[arg(long, value_name = "FILTER")]
    log_filter: Option<String>,

    /// Include failure text in catch-all 500 responses.
    #[arg(long, conflicts_with = "hide_error_details")]
    expose_error_details: bool,

    /// Replace failure text in catch-all 500 responses with a generic note.
    #[arg(long)]
    hide_error_details: bool,
}

impl Cli {
    fn overrides(&self) -> PartialConfig {
        let expose_error_details = match (self.expose_error_details, self.hide_error_details) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        PartialConfig {
            model_dir: self.model_dir.clone(),
            system_file: self.system_file.clone(),
            artifacts_file: self.artifacts_file.clone(),
            bind_addr: self.bind.clone(),
            log_file: self.log_file.clone(),
            log_filter: self.log_filter.clone(),
            expose_error_details,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new().with_overrides(cli.overrides());
    if let Some(path) = cli.config.clone() {
        loader = loader.with_config_file(path);
    }
    let config = loader.load().context("failed to load configuration")?;

    let _log_guard = init_logging(&config).context("failed to initialize logging")?;
    tracing::info!("severity-server v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!("System bundle: {}", config.system_path().display());
    tracing::info!("Preprocessing bundle: {}", config.artifacts_path().display());

    let predictor = Predictor::from_artifacts(load_artifacts(&config));
    if let severity_core::ModelState::Degraded { reason } = predictor.state() {
        tracing::warn!("Serving in degraded mode: {reason}");
    }
    let state = AppState::new(predictor, config.expose_error_details);

    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Starting server at http://{}/", listener.local_addr()?);

    severity_server::serve(listener, state, shutdown_signal()).await?;

    tracing::info!("severity-server exiting cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("Signal received, shutting down");
}
