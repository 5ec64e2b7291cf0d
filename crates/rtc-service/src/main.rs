//! RTC service
//!
//! Runs the coordination core: connection registry, call coordinator,
//! channel mesh and attachment upload engine, plus the health and metrics
//! HTTP server.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the Postgres pool
//! 4. Create the registry and spawn the supervised actors
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Wait for shutdown signal, then cancel the actors

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common::secret::ExposeSecret;
use rtc_service::actors::{
    AttachmentEngineHandle, CallCoordinatorHandle, ChannelMeshHandle, ConnectionRegistry,
    RestartPolicy, SupervisorExit,
};
use rtc_service::config::Config;
use rtc_service::observability::metrics::init_metrics_recorder;
use rtc_service::observability::{health_router, HealthState};
use rtc_service::repositories::{AttachmentRepository, ChannelRepository};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long supervisors get to wind down after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtc_service=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting RTC service");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    info!(
        health_bind_address = %config.health_bind_address,
        db_max_connections = config.db_max_connections,
        call_max_restarts = config.call_max_restarts,
        "Configuration loaded successfully"
    );

    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow::anyhow!(e)
    })?;
    let health_state = Arc::new(HealthState::new());

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(config.db_acquire_timeout)
        .connect(config.database_url.expose_secret())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to database");
            e
        })
        .context("database connection")?;
    info!("Database connection established");

    let shutdown_token = CancellationToken::new();
    let registry = ConnectionRegistry::new();

    let (_calls, calls_task) = CallCoordinatorHandle::spawn(
        Arc::clone(&registry),
        config.call_settings(),
        RestartPolicy::Bounded(config.call_max_restarts),
        shutdown_token.child_token(),
    );
    let (_channels, channels_task) = ChannelMeshHandle::spawn(
        Arc::clone(&registry),
        ChannelRepository::new(pool.clone()),
        config.db_query_timeout,
        RestartPolicy::Unbounded,
        shutdown_token.child_token(),
    );
    let (_attachments, attachments_task) = AttachmentEngineHandle::spawn(
        Arc::clone(&registry),
        AttachmentRepository::new(pool.clone()),
        config.upload_settings(),
        RestartPolicy::Unbounded,
        shutdown_token.child_token(),
    );
    info!("Actors started");

    let supervisors = tokio::spawn(watch_supervisors(
        vec![
            ("calls", calls_task),
            ("channel_mesh", channels_task),
            ("attachments", attachments_task),
        ],
        Arc::clone(&health_state),
    ));

    let health_addr: SocketAddr = config
        .health_bind_address
        .parse()
        .with_context(|| format!("invalid health bind address {}", config.health_bind_address))?;
    let app = health_router(Arc::clone(&health_state), Some(prometheus_handle));
    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("failed to bind health server to {health_addr}"))?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    health_state.set_ready();
    info!("RTC service running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    health_state.set_not_ready();
    shutdown_token.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, supervisors).await.is_err() {
        warn!("Actors did not stop within the grace period");
    }
    pool.close().await;

    info!("RTC service shutdown complete");
    Ok(())
}

/// Wait for every supervisor. An actor that stops for any reason other than
/// cancellation takes the service out of rotation.
async fn watch_supervisors(
    tasks: Vec<(&'static str, JoinHandle<SupervisorExit>)>,
    health_state: Arc<HealthState>,
) {
    let waits = tasks.into_iter().map(|(name, task)| {
        let health_state = Arc::clone(&health_state);
        async move {
            match task.await {
                Ok(SupervisorExit::Completed) => {
                    info!(actor = name, "Actor supervisor finished");
                }
                Ok(exit) => {
                    error!(actor = name, exit = ?exit, "Actor stopped permanently");
                    health_state.set_not_ready();
                }
                Err(e) => {
                    error!(actor = name, error = %e, "Supervisor task failed");
                    health_state.set_not_ready();
                }
            }
        }
    });
    futures::future::join_all(waits).await;
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
