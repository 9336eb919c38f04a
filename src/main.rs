use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use valmesh::{
    Bootstrap, BootstrapError, EventPayloads, GossipSink, HttpTopologyProvider, Keypair,
    MeshConfig, Transactions, ValidatorId,
};

/// Logs every batch received from the mesh.
struct LogSink;

impl GossipSink for LogSink {
    fn handle_validator_events(&self, events: EventPayloads) {
        info!(count = events.len(), "received validator events");
    }

    fn handle_validator_txs(&self, txs: Transactions) {
        info!(count = txs.len(), "received validator transactions");
    }
}

#[derive(Parser, Debug)]
#[command(name = "valmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    listen: SocketAddr,

    #[arg(short = 'i', long)]
    validator_id: u32,

    /// Hex-encoded 32-byte Ed25519 seed. A fresh key is generated if omitted.
    #[arg(short = 'k', long, env = "VALMESH_SECRET_KEY")]
    secret_key: Option<String>,

    #[arg(short, long, default_value = "http://localhost:9669")]
    provider: String,

    #[arg(short, long, default_value = "60")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = match &args.secret_key {
        Some(hex) => Keypair::from_secret_key_hex(hex).map_err(BootstrapError::Identity)?,
        None => {
            warn!("no secret key given, generating an ephemeral identity");
            Keypair::generate()
        }
    };

    let mut config = MeshConfig::new(args.listen, ValidatorId(args.validator_id), keypair.secret_key_bytes());
    config.provider_endpoint = args.provider.clone();

    let provider = HttpTopologyProvider::new(&config.provider_endpoint)?;
    let bootstrap = Bootstrap::bind(config, Arc::new(LogSink)).await?;
    info!("Validator address: {}", bootstrap.self_addr());

    let service = bootstrap
        .run(&provider)
        .await
        .context("validator mesh bootstrap failed")?;

    let shutdown = CancellationToken::new();
    for peer in service.host().peers().identities() {
        let mut probe = service.alive_validator(peer, &shutdown);
        tokio::spawn(async move {
            while let Some(round) = probe.next().await {
                if let Err(e) = round {
                    warn!(peer = %peer.short(), error = %e, "liveness probe ended");
                }
            }
        });
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                shutdown.cancel();
                break;
            }
            _ = interval.tick() => {
                let peers = service.host().peers();
                for peer in peers.identities() {
                    if let Some(latency) = peers.latency(&peer) {
                        info!(
                            peer = %peer.short(),
                            rtt_ms = format!("{:.2}", latency.smoothed.as_secs_f64() * 1000.0),
                            samples = latency.samples,
                            "peer latency"
                        );
                    }
                }
                let stats = service.resources().stats();
                info!(
                    peers = peers.len(),
                    reserved_bytes = stats.reserved_bytes,
                    reservations = stats.outstanding_reservations,
                    "telemetry snapshot"
                );
            }
        }
    }

    Ok(())
}
