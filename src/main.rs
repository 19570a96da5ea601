use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ongarde::allowlist::loader::AllowlistLoader;
use ongarde::audit::jsonl::JsonlAuditBackend;
use ongarde::audit::AuditBackend;
use ongarde::proxy::upstream::UpstreamClient;
use ongarde::scanner::pool::{effective_thresholds, shutdown_scan_worker, startup_scan_worker};
use ongarde::{build_router, config, dashboard, AppState};

#[derive(Parser)]
#[command(name = "ongarde", about = "OnGarde — intercepting security proxy for AI agent traffic")]
struct Cli {
    /// Explicit config file path (overrides the default search order).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy server.
    Serve {
        /// Listen port (overrides config and ONGARDE_PORT).
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ongarde=debug,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Cli::parse();
    let mut cfg = config::load(args.config.as_deref())?;

    let port_override = match args.command {
        Some(Commands::Serve { port }) => port,
        None => None,
    };
    if let Some(port) = port_override {
        cfg.proxy.port = port;
    }

    run_server(cfg).await
}

async fn run_server(cfg: config::Config) -> anyhow::Result<()> {
    let upstream = UpstreamClient::new()?;

    // NLP worker + hardware calibration — completes before the readiness
    // gate opens; failure degrades to regex-only scanning.
    let (worker, calibration) = startup_scan_worker(&cfg.scanner).await;
    let (sync_cap, timeout) = effective_thresholds(&calibration, &cfg.scanner);

    // Allowlist: initial load + hot-reload watcher.
    let allowlist = Arc::new(AllowlistLoader::default());
    let allowlist_path = cfg.allowlist_path();
    match allowlist.load(&allowlist_path) {
        Ok(count) => tracing::info!(count, path = %allowlist_path.display(), "allowlist loaded"),
        Err(e) => tracing::warn!(error = %e, "allowlist load failed — starting with empty allowlist"),
    }

    // Audit backend (JSONL). A failed open degrades to no audit trail
    // rather than refusing to start.
    let audit: Option<Arc<dyn AuditBackend>> = match JsonlAuditBackend::open(cfg.audit_path()).await
    {
        Ok(backend) => {
            match backend.prune_older_than(cfg.audit.retention_days).await {
                Ok(0) => {}
                Ok(dropped) => tracing::info!(dropped, "expired audit events pruned"),
                Err(e) => tracing::warn!(error = %e, "audit retention prune failed (non-fatal)"),
            }
            Some(Arc::new(backend))
        }
        Err(e) => {
            tracing::error!(error = %e, "audit backend unavailable — events will not be persisted");
            None
        }
    };

    let host = cfg.proxy.host.clone();
    let port = cfg.proxy.port;
    let state = Arc::new(AppState::new(
        cfg,
        upstream,
        worker,
        calibration,
        allowlist.clone(),
        audit.clone(),
    ));

    // Install calibrated thresholds, then open the readiness gate. Write
    // order matters: thresholds are read lock-free during request handling.
    state.thresholds.update_calibration(sync_cap, timeout);
    state.mark_ready();

    let watcher = allowlist.spawn_watcher(allowlist_path, dashboard::log_notifier());

    let app = build_router(state.clone());
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address {host}:{port}: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, tier = state.calibration.tier.as_str(), "OnGarde listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Orderly teardown: watcher first, then the worker (waits for in-flight
    // work), then a best-effort audit drain.
    watcher.abort();
    shutdown_scan_worker(state.worker.as_ref()).await;
    if let Some(audit) = audit {
        if let Err(e) = audit.close().await {
            tracing::warn!(error = %e, "audit close failed");
        }
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
