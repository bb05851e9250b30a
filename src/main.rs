//! graceful-http - serve the demo app until told to stop
//!
//! Usage:
//!     graceful-http [--config <path>] [--listen <addr>]
//!
//! See --help for more options.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info, warn};

use graceful_http::app::App;
use graceful_http::config::{load_config, validate_config, Config};
use graceful_http::metrics::MetricsCollector;
use graceful_http::util::init_logging;
use graceful_http::{GracefulServer, StopReason};

/// An HTTP server that drains connections before exiting.
#[derive(Parser, Debug)]
#[command(name = "graceful-http")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (defaults are used when omitted)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("failed to load configuration from '{}'", path.display()))?,
        None => Config::default(),
    };

    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(level) = cli.log_level {
        config.global.log_level = level;
    }
    validate_config(&config)
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;

    init_logging(&config.global.log_level, &config.global.log_format)
        .context("failed to initialize logging")?;

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Listen: {}", config.server.listen);
        println!("  TLS: {}", config.server.tls.is_some());
        println!("  HTTP/2: {}", config.server.http2);
        match config.server.drain_timeout {
            Some(limit) => println!("  Drain timeout: {}", humantime::format_duration(limit)),
            None => println!("  Drain timeout: none"),
        }
        return Ok(());
    }

    info!(
        listen = %config.server.listen,
        tls = config.server.tls.is_some(),
        http2 = config.server.http2,
        read_timeout_ms = config.server.read_timeout.as_millis(),
        write_timeout_ms = config.server.write_timeout.as_millis(),
        "graceful-http starting"
    );

    run(config)
}

/// Run the server on a multi-threaded runtime.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async { run_async(config).await })
}

/// Async entry point.
async fn run_async(config: Config) -> Result<()> {
    let metrics = MetricsCollector::new();

    let mut app = App::new();
    if config.global.metrics.enabled {
        app = app.with_metrics(metrics.clone(), config.global.metrics.path.clone());
    }

    let server = GracefulServer::from_config(&config.server, app).with_metrics(metrics);

    info!("press Ctrl+C to stop");

    let result = match &config.server.tls {
        Some(tls) => server.listen_and_serve_tls(&tls.cert, &tls.key).await,
        None => server.listen_and_serve().await,
    };

    match result {
        Ok(StopReason::Graceful) => {
            info!("{}", StopReason::Graceful);
            Ok(())
        }
        Ok(StopReason::Killed) => {
            warn!("{}", StopReason::Killed);
            bail!(StopReason::Killed)
        }
        Err(e) => {
            error!(error = %e, "server failed");
            Err(e).context("server failed")
        }
    }
}
