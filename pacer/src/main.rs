use anyhow::Context as _;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aya::maps::RingBuf;
use aya::programs::{Xdp, XdpFlags};
use aya::Ebpf;

use pacer_common::{MAP_NAME, PROGRAM_NAME};

mod api;
mod config;
mod dns;
mod reader;
mod state;

use config::{CliArgs, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // ── eBPF setup ────────────────────────────────────────────────────
    let mut bpf = Ebpf::load_file(&config.bpf_object)
        .with_context(|| format!("failed to load eBPF object {}", config.bpf_object))?;

    let program: &mut Xdp = bpf
        .program_mut(PROGRAM_NAME)
        .with_context(|| format!("program {PROGRAM_NAME} not found in eBPF object"))?
        .try_into()?;
    program.load()?;

    for iface in &config.interfaces {
        program
            .attach(iface, XdpFlags::from(config.xdp_mode))
            .with_context(|| format!("failed to attach XDP program to {iface}"))?;
        tracing::info!("XDP program attached to {} ({:?} mode)", iface, config.xdp_mode);
    }

    // ── Source table ──────────────────────────────────────────────────
    let sources = Arc::new(state::SourceTable::new());

    // ── Ring buffer reader ────────────────────────────────────────────
    let packets_map = bpf
        .take_map(MAP_NAME)
        .with_context(|| format!("map {MAP_NAME} not found in eBPF object"))?;
    let ring_buf = RingBuf::try_from(packets_map)?;
    tokio::spawn(reader::RecordReader::new(ring_buf, sources.clone()).run());

    // ── Stale source pruning ──────────────────────────────────────────
    if let Some(stale_after) = config.stale_after_seconds {
        let sources_prune = sources.clone();
        let timeout = Duration::from_secs(stale_after);
        tokio::spawn(async move {
            let mut prune_interval = interval(Duration::from_secs(10));
            loop {
                prune_interval.tick().await;
                let removed =
                    sources_prune.prune_stale(timeout, chrono::Utc::now().timestamp_millis());
                if removed > 0 {
                    tracing::debug!("pruned {} stale sources", removed);
                }
            }
        });
    }

    // ── DNS Cache (optional) ──────────────────────────────────────────
    let dns_cache = if config.resolve_dns {
        tracing::info!("Reverse DNS resolution enabled");
        Some(Arc::new(dns::DnsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(2),
        )))
    } else {
        None
    };

    // ── HTTP API ──────────────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        sources: sources.clone(),
        dns: dns_cache,
        start_time: std::time::Instant::now(),
    });
    let app = api::router(app_state, &config.allowed_ips)?;

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("Metrics on http://0.0.0.0:{}/metrics", config.port);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Dropping `bpf` detaches the program from every interface.
    tracing::info!("Shutting down, detaching XDP program");
    drop(bpf);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
