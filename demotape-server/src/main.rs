use clap::Parser;
use demotape_core::config::Config;
use demotape_core::events::{CacheEvent, CacheEvents};
use demotape_core::locator::InMemoryCatalog;
use demotape_core::policy::StaticAccessPolicy;
use demotape_core::server::create_router;
use demotape_core::service::DeliveryService;
use demotape_core::sweeper::{RetentionSweeper, DEFAULT_CHECK_INTERVAL};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// demotape headless server: serves demo and full audio assets over HTTP.
#[derive(Parser)]
#[command(name = "demotape-server")]
struct Args {
    /// Base directory holding demotape.yaml and the cache areas.
    /// Defaults to the platform data directory.
    #[arg(long, env = "DEMOTAPE_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// YAML list of `{product_id, track_index, uri}` catalog entries.
    #[arg(long, env = "DEMOTAPE_CATALOG")]
    catalog: PathBuf,

    /// YAML file of token grants. Without it every requester gets demos.
    #[arg(long, env = "DEMOTAPE_POLICY")]
    policy: Option<PathBuf>,

    /// Port for the delivery endpoint.
    #[arg(long, default_value = "8080", env = "DEMOTAPE_PORT")]
    port: u16,

    /// Address to bind the server to.
    #[arg(long, default_value = "0.0.0.0", env = "DEMOTAPE_BIND")]
    bind: String,
}

fn configure_logging() {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_line_number(true)
        .with_target(false)
        .with_file(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() {
    configure_logging();
    let args = Args::parse();

    info!("demotape-server starting");

    let config = Config::load(args.base_dir.clone()).unwrap_or_else(|e| {
        error!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    let cache_dir = config.cache_dir();
    if let Err(e) = cache_dir.ensure_layout().await {
        error!("Failed to prepare {}: {e}", cache_dir.display());
        std::process::exit(1);
    }
    info!("Cache directory: {}", cache_dir.display());

    let catalog = InMemoryCatalog::from_yaml_file(&args.catalog)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to load catalog {}: {e}", args.catalog.display());
            std::process::exit(1);
        });

    let policy = match &args.policy {
        Some(path) => StaticAccessPolicy::from_yaml_file(path, config.resolver())
            .await
            .unwrap_or_else(|e| {
                error!("Failed to load policy {}: {e}", path.display());
                std::process::exit(1);
            }),
        None => {
            info!("No policy file, serving demos only");
            StaticAccessPolicy::new(config.resolver())
        }
    };

    let events = CacheEvents::new();
    spawn_event_logger(&events);

    let service = DeliveryService::from_config(
        &config,
        Arc::new(catalog),
        Arc::new(policy),
        events.clone(),
    )
    .unwrap_or_else(|e| {
        error!("Failed to build delivery service: {e}");
        std::process::exit(1);
    });
    let service = Arc::new(service);

    let shutdown = CancellationToken::new();
    let sweeper = RetentionSweeper::new(cache_dir, events).spawn_periodic(
        config.retention_interval,
        DEFAULT_CHECK_INTERVAL,
        shutdown.clone(),
    );

    let app = create_router(service.clone());
    let addr = format!("{}:{}", args.bind, args.port);

    info!("Binding to {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {addr}: {e}");
            std::process::exit(1);
        });

    info!("demotape-server listening on http://{addr}");
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown_signal())
    .await;

    shutdown.cancel();
    service.cache().shutdown();
    let _ = sweeper.await;

    if let Err(e) = result {
        error!("Server error: {e}");
        std::process::exit(1);
    }
    info!("demotape-server stopped");
}

fn spawn_event_logger(events: &CacheEvents) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(CacheEvent::Created { key, size_bytes, .. }) => {
                    debug!("Cached {} ({} bytes)", key, size_bytes)
                }
                Ok(CacheEvent::Deleted { path, .. }) => debug!("Deleted {}", path.display()),
                Ok(CacheEvent::Swept { removed }) => {
                    info!("Retention sweep removed {removed} entries")
                }
                Err(RecvError::Lagged(n)) => debug!("Event logger skipped {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("Shutdown signal received");
}
