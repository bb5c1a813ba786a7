//! API server entry point.

use std::sync::Arc;
use std::time::Duration;

use api::config::Config;
use api::{AppState, Orchestrator, SharedStore};
use resilience::{TelemetrySink, TracingSink};
use saga::{OrchestratorConfig, ScriptedInvoker, StepInvoker, WorkerPool};
use sqlx::postgres::PgPoolOptions;
use state_store::{InMemoryStore, PostgresStore, TimedStore};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn connect_store(config: &Config) -> Result<SharedStore, BoxError> {
    let Some(url) = &config.database_url else {
        tracing::warn!("DATABASE_URL not set, state is kept in memory and lost on restart");
        return Ok(Arc::new(TimedStore::new(
            InMemoryStore::new(),
            config.store_timeout,
        )));
    };

    let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
    let store = PostgresStore::new(pool);
    store.run_migrations().await?;
    tracing::info!("connected to PostgreSQL state store");
    Ok(Arc::new(TimedStore::new(store, config.store_timeout)))
}

/// Frees leases held past their TTL until shutdown.
fn spawn_lease_reaper(
    orchestrator: Arc<Orchestrator>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    orchestrator.pools().reap_expired();
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Build the orchestrator over the configured store
    let store = connect_store(&config).await?;
    let registry = api::demo::registry()?;
    let invoker: Arc<dyn StepInvoker> = Arc::new(ScriptedInvoker::new());
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(TracingSink);
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        registry,
        invoker,
        config.resilience.clone(),
        OrchestratorConfig::default(),
        telemetry,
    ));

    // 4. Resume owned instances in the background
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shard = config.worker.shard();
    let workers = WorkerPool::new(orchestrator.clone(), config.worker.clone()).spawn(shutdown_rx.clone());
    let reaper_every = (config.resilience.lease_ttl / 2).max(Duration::from_secs(1));
    let reaper = spawn_lease_reaper(orchestrator.clone(), reaper_every, shutdown_rx);

    // 5. Build the application
    let state = Arc::new(AppState {
        orchestrator,
        shard,
    });
    let app = api::create_app(state, metrics_handle);

    // 6. Start server
    let addr = config.addr();
    tracing::info!(
        %addr,
        replica_index = shard.replica_index(),
        replica_count = shard.replica_count(),
        "starting API server"
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 7. Stop background tasks
    let _ = shutdown_tx.send(true);
    if let Err(e) = workers.await {
        tracing::warn!(error = %e, "worker pool task ended abnormally");
    }
    if let Err(e) = reaper.await {
        tracing::warn!(error = %e, "lease reaper task ended abnormally");
    }

    tracing::info!("server shut down gracefully");
    Ok(())
}
