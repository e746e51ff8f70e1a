//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use api::{Services, build_services, in_memory_services};
use event_store::{EventStore, NamedLock, PostgresEventStore};
use metrics_exporter_prometheus::PrometheusHandle;
use projections::{PostgresReadModelStore, ReadModelStore};
use scheduler::{PostgresReservationService, PostgresSchedulerStore, SchedulerStore};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
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
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Polls the catchup and serves HTTP until a shutdown signal arrives.
async fn serve<S, R, T>(services: Services<S, R, T>, metrics_handle: PrometheusHandle, config: &Config)
where
    S: EventStore + NamedLock + Clone + 'static,
    R: ReadModelStore + 'static,
    T: SchedulerStore + 'static,
{
    let polling = services.catchup.poll_event_store(config.catchup_poll_interval);
    let app = api::create_app(services.state.clone(), metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, catchup = services.catchup.name(), "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    polling.stop().await;
    services.catchup.dispose();
}

#[tokio::main]
async fn main() {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick backends and start serving
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .expect("failed to connect to PostgreSQL");
            let event_store = PostgresEventStore::new(pool.clone());
            event_store.run_migrations().await.expect("migrations failed");
            tracing::info!("using PostgreSQL backends");

            let services = build_services(
                event_store,
                PostgresReadModelStore::new(pool.clone()),
                PostgresSchedulerStore::new(pool.clone()),
                Arc::new(PostgresReservationService::new(pool)),
                &config,
            )
            .expect("failed to build catchup");
            serve(services, metrics_handle, &config).await;
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory backends");
            let services = in_memory_services(&config).expect("failed to build catchup");
            serve(services, metrics_handle, &config).await;
        }
    }

    tracing::info!("server shut down gracefully");
}
