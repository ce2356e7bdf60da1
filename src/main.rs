//! Gateway binary.
//!
//! ```text
//! api-gateway --config gateway.toml          run until SIGINT/SIGTERM
//! api-gateway --config gateway.toml --check  validate and build, then exit
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use api_gateway::config::load_config;
use api_gateway::observability::{logging, metrics};
use api_gateway::{Gateway, Shutdown};

#[derive(Parser)]
#[command(name = "api-gateway")]
#[command(about = "HTTP/1.1, HTTP/2 and HTTP/3 API gateway", long_about = None)]
struct Cli {
    /// Configuration file (TOML).
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Validate and build the configuration, then exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init_from_env() {
        eprintln!("logging: {e}");
        return ExitCode::FAILURE;
    }
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "api-gateway starting");

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Configuration rejected");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = metrics::install() {
        tracing::warn!(error = %e, "Metrics recorder not installed");
    }

    let gateway = match Gateway::build(&config).await {
        Ok(gateway) => gateway,
        Err(e) => {
            tracing::error!(kind = %e.kind(), error = %e, "Build failed");
            return ExitCode::FAILURE;
        }
    };
    if cli.check {
        tracing::info!("Configuration OK");
        return ExitCode::SUCCESS;
    }

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    match gateway.run(shutdown.token()).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(kind = %e.kind(), error = %e, "Gateway stopped with error");
            ExitCode::FAILURE
        }
    }
}
