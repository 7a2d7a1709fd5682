mod access_log;
mod handlers;
mod state;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use clap::Parser;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use replmon_core::collector::SnapshotCollector;
use replmon_core::config::MonitorConfig;
use replmon_core::hub::BroadcastHub;

use access_log::AccessLogLayer;
use state::SharedState;

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(
    name = "replmon-web",
    about = "PostgreSQL logical replication monitor",
    version = replmon_core::VERSION
)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml", env = "REPLMON_CONFIG")]
    config: PathBuf,

    /// Listen address. Overrides server.listen and server.port.
    #[arg(long, env = "REPLMON_LISTEN")]
    listen: Option<String>,

    /// Refresh interval in seconds. Overrides server.refresh_interval.
    #[arg(long, env = "REPLMON_INTERVAL")]
    interval: Option<u64>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async_main(args));
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("replmon_web={level},replmon_core={level}"))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn async_main(args: Args) {
    let mut config = match MonitorConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "failed to load configuration");
            process::exit(1);
        }
    };
    if let Some(listen) = args.listen {
        config.server.listen = Some(listen);
    }
    if let Some(interval) = args.interval {
        config.server.refresh_interval = interval;
    }
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        process::exit(1);
    }

    info!(
        version = replmon_core::VERSION,
        config = %args.config.display(),
        databases = config.databases.len(),
        refresh_interval_s = config.server.refresh_interval,
        "starting"
    );
    for db in &config.databases {
        info!(name = %db.name, role = %db.role, host = %db.host, port = db.port, "monitoring database");
    }

    let collector = match SnapshotCollector::from_config(&config) {
        Ok(collector) => collector,
        Err(e) => {
            error!(error = %e, "failed to prepare database readers");
            process::exit(1);
        }
    };
    let hub = Arc::new(BroadcastHub::new(
        Arc::new(collector),
        config.monitoring.write_timeout(),
    ));

    let ticker = tokio::spawn(Arc::clone(&hub).run(config.server.refresh_interval()));

    let app = router(Arc::clone(&hub)).into_make_service_with_connect_info::<SocketAddr>();

    let addr = config.server.listen_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind");
            process::exit(1);
        }
    };
    info!(%addr, "listening");

    let shutdown_hub = Arc::clone(&hub);
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
        ticker.abort();
        shutdown_hub.close().await;
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "server error");
        process::exit(1);
    }
    info!("stopped");
}

/// Builds the HTTP surface over `hub`.
fn router(hub: SharedState) -> Router {
    // Compression stays off the upgrade route.
    let api = Router::new()
        .route("/api/health", get(handlers::handle_health))
        .route("/api/snapshot", get(handlers::handle_snapshot))
        .route("/snapshot", get(handlers::handle_snapshot))
        .route(
            "/api/discrepancy-check",
            post(handlers::handle_discrepancy_check),
        )
        .layer(CompressionLayer::new());

    Router::new()
        .route("/api/ws", get(handlers::handle_ws))
        .merge(api)
        .with_state(hub)
        .layer(AccessLogLayer)
        .layer(CorsLayer::permissive())
}
