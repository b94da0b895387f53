//! SEMILLA Bridge Settlement Engine
//!
//! Moves the platform-native SEMILLA credit between the internal ledger and
//! external chains while protecting the custody pool: state-machine ledger,
//! blacklist enforcement, circuit breaker, and security-event aggregation.

use std::sync::Arc;
use std::time::Instant;

use semilla_bridge::adapter::HttpChainAdapter;
use semilla_bridge::api::{self, AppState};
use semilla_bridge::blacklist::BlacklistEnforcer;
use semilla_bridge::breaker::CircuitBreaker;
use semilla_bridge::config::Config;
use semilla_bridge::db;
use semilla_bridge::metrics;
use semilla_bridge::monitor::SecurityMonitor;
use semilla_bridge::orchestrator::BridgeOrchestrator;
use semilla_bridge::registry::ChainRegistry;
use semilla_bridge::staleness::StalenessWatcher;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    // Run the async main
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting SEMILLA Bridge Settlement Engine");

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        api_port = config.api.port,
        adapter_timeout_secs = config.adapter.timeout_secs,
        critical_trip_threshold = config.security.critical_trip_threshold,
        "Configuration loaded"
    );

    // Connect to database
    let pool = db::create_pool(&config.database.url, config.database.max_connections).await?;
    tracing::info!("Database connected");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    // Build the injected state objects
    let registry = Arc::new(ChainRegistry::load(&pool).await?);
    tracing::info!(chains = registry.len(), "Chain registry loaded");

    let blacklist = Arc::new(BlacklistEnforcer::load(pool.clone()).await?);
    let breaker = Arc::new(CircuitBreaker::new());
    let monitor = Arc::new(SecurityMonitor::new(
        pool.clone(),
        breaker.clone(),
        config.security.clone(),
    ));
    let adapter = Arc::new(HttpChainAdapter::new(&config.adapter)?);

    let orchestrator = Arc::new(BridgeOrchestrator::new(
        pool.clone(),
        registry.clone(),
        blacklist.clone(),
        breaker.clone(),
        monitor.clone(),
        adapter,
        config.adapter.clone(),
        config.policy.clone(),
    ));

    // Create shutdown channel for the staleness watcher
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    // Setup signal handlers
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    let mut watcher = StalenessWatcher::new(pool.clone(), monitor.clone(), config.policy.clone());

    let state = AppState {
        db: pool,
        orchestrator,
        registry,
        blacklist,
        breaker,
        monitor,
        started_at: Instant::now(),
    };

    metrics::UP.set(1.0);
    tracing::info!("Engine initialized, serving requests");

    // Run the API server and the staleness watcher concurrently
    tokio::select! {
        result = api::start_server(state, &config.api) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "API server error");
            }
        }
        result = watcher.run(shutdown_rx) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Staleness watcher error");
            }
        }
    }

    tracing::info!("SEMILLA Bridge Settlement Engine stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,semilla_bridge=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
