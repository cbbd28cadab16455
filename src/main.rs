#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use xray_edge_gateway::config::GatewayConfig;
use xray_edge_gateway::server::{self, AppState};

const IDENTITY_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
const SUBSCRIPTION_PURGE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
const IP_LIMITER_GC_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "xray-edge-gateway", about = "Transport-aware reverse proxy frontend for tunneled protocols")]
struct Cli {
    /// Listen address, overrides LISTEN_ADDR.
    #[arg(short, long)]
    listen: Option<String>,

    /// Admin API listen address (serves /metrics only), overrides ADMIN_LISTEN_ADDR.
    #[arg(long)]
    admin_listen: Option<String>,
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = GatewayConfig::from_env();
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(admin_listen) = cli.admin_listen {
        config.admin_listen_addr = admin_listen;
    }

    let worker_threads = xray_edge_gateway::runtime::get_container_cpu_limit();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(run(config))
}

async fn run(config: GatewayConfig) -> Result<()> {
    let metrics = xray_edge_gateway::metrics::Metrics::install()?;
    let listen = config.listen_addr.clone();
    let admin_listen = config.admin_listen_addr.clone();
    let state = AppState::new(config, metrics);

    let shutdown = Arc::new(Notify::new());

    let sweep_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(IDENTITY_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            sweep_state.identity.sweep();
        }
    });

    let gc_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(IP_LIMITER_GC_INTERVAL);
        loop {
            ticker.tick().await;
            gc_state.ip_limiter.gc();
        }
    });

    if let Some(subscription) = state.subscription.clone() {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SUBSCRIPTION_PURGE_INTERVAL);
            loop {
                ticker.tick().await;
                subscription.purge_cache();
            }
        });
    }

    let admin_state = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_listen, admin_state).await {
            tracing::error!("server: admin server exited: {e}");
        }
    });

    let signal_shutdown = Arc::clone(&shutdown);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("server: shutdown signal received");
        signal_shutdown.notify_waiters();
    });

    server::run_proxy_server(&listen, state, shutdown).await
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(guard);
}
