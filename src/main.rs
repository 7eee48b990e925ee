//! Media Relay Server
//!
//! Entry point for the media relay. Loads configuration, sets up logging and
//! either serves the browser-facing API or runs one indexing job from the
//! command line.

use anyhow::Context;
use clap::{Parser, Subcommand};
use media_relay::event_stream::{EventStreamReader, ReaderState};
use media_relay::index_job::{format_progress_line, IndexJobClient};
use media_relay::metrics_endpoint::MetricsEndpoint;
use media_relay::range_proxy::build_upstream_client;
use media_relay::server::{self, AppState};
use media_relay::{RelayConfig, RelayMetrics};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "media-relay", version, about = "Range-preserving media relay")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true, default_value = "media_relay.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the browser-facing API (default)
    Serve,
    /// Start an indexing job and print its progress
    Index,
}

fn load_config(path: &PathBuf) -> anyhow::Result<RelayConfig> {
    if path.exists() {
        RelayConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    } else {
        Ok(RelayConfig::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level()?)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Configuration loaded from {}", cli.config.display());
    info!("  - Listen address: {}", config.listen_address);
    info!("  - Upstream: {}", config.upstream_base);
    info!(
        "  - Cache max-age (stream/thumb/archive): {}/{}/{} seconds",
        config.stream_max_age_secs, config.thumbnail_max_age_secs, config.archive_image_max_age_secs
    );
    info!("  - Prefetch batch size: {}", config.prefetch.batch_size);

    let config = Arc::new(config);
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Index => index(config).await,
    }
}

async fn serve(config: Arc<RelayConfig>) -> anyhow::Result<()> {
    let metrics = Arc::new(RelayMetrics::new());

    if let Some(endpoint) = config.metrics_endpoint.as_ref().filter(|m| m.enabled) {
        let addr = endpoint
            .address
            .parse::<std::net::SocketAddr>()
            .context("Invalid metrics endpoint address")?;
        let endpoint = MetricsEndpoint::new(Arc::clone(&metrics), addr);
        tokio::spawn(async move {
            if let Err(e) = endpoint.start().await {
                error!("Metrics endpoint failed: {}", e);
            }
        });
    }

    let addr = config.listen_socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let state = Arc::new(AppState::new(Arc::clone(&config), Arc::clone(&metrics))?);

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        server::shutdown_signal().await;
        trigger.cancel();
    });

    server::serve(listener, state, shutdown).await?;

    let stats = metrics.get_stats();
    info!(
        "Relayed {} responses ({} partial), {} bytes to clients",
        stats.relayed_requests, stats.partial_responses, stats.bytes_to_client
    );
    info!("Server shutdown complete");
    Ok(())
}

async fn index(config: Arc<RelayConfig>) -> anyhow::Result<()> {
    let client = build_upstream_client(config.connect_timeout())?;
    let jobs = IndexJobClient::new(client, Arc::clone(&config), Arc::new(RelayMetrics::new()));

    let mut reader = EventStreamReader::new();
    let abort = reader.abort_handle();
    tokio::spawn(async move {
        server::shutdown_signal().await;
        abort.abort();
    });

    println!("Starting indexing...");
    let state = jobs
        .run_with(&mut reader, |event| println!("{}", format_progress_line(&event)))
        .await;

    match state {
        ReaderState::Completed => Ok(()),
        ReaderState::Aborted => {
            println!("Indexing aborted");
            Ok(())
        }
        other => anyhow::bail!("Indexing job ended in state {:?}", other),
    }
}
