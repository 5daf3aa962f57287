//! Signal Service
//!
//! Room-scoped signaling mailbox for the Tabletop Mesh peer mesh.
//!
//! # Servers
//!
//! - HTTP/WebSocket signal API (default: 0.0.0.0:8080)
//! - HTTP health + metrics server (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing
//! 3. Initialize Prometheus metrics recorder
//! 4. Build the signal repository (memory or Redis)
//! 5. Spawn the expiry task
//! 6. Start health and API servers
//! 7. Wait for shutdown signal, then drain

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use secrecy::ExposeSecret;
use signal_service::clock::{Clock, SystemClock};
use signal_service::config::{Config, LogFormat, StoreBackend};
use signal_service::errors::SignalError;
use signal_service::hub::SignalHub;
use signal_service::observability::metrics::init_metrics_recorder;
use signal_service::observability::{health_router, HealthState};
use signal_service::presence::InMemoryPresence;
use signal_service::routes::{build_routes, AppState};
use signal_service::store::{
    MemorySignalRepository, RedisSignalRepository, SignalRepository, SignalService,
};
use signal_service::tasks::{start_signal_expiry, ExpiryConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first: the log format is part of it
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    init_tracing(config.log_format);

    info!("Starting Signal Service");
    info!(
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        store_backend = ?config.store_backend,
        ttl_ms = config.ttl_ms,
        expiry_interval_seconds = config.expiry_interval_seconds,
        presence_window_ms = config.presence_window_ms,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let repository: Arc<dyn SignalRepository> = match config.store_backend {
        StoreBackend::Memory => {
            info!("Using in-memory signal store");
            Arc::new(MemorySignalRepository::new())
        }
        StoreBackend::Redis => {
            let redis_url = config
                .redis_url
                .as_ref()
                .ok_or_else(|| SignalError::Config("REDIS_URL is required".to_string()))?;
            info!("Connecting to Redis...");
            let repository = RedisSignalRepository::new(redis_url.expose_secret()).await?;
            info!("Redis connection established");
            Arc::new(repository)
        }
    };

    let presence = Arc::new(InMemoryPresence::new(
        Arc::clone(&clock),
        config.presence_window_ms,
    ));
    let service = SignalService::new(
        repository,
        presence,
        SignalHub::new(config.hub_capacity),
        clock,
        config.ttl_ms,
    );
    let health_state = Arc::new(HealthState::new(service.clone()));

    let shutdown_token = CancellationToken::new();

    // Expiry task
    let expiry_token = shutdown_token.child_token();
    let expiry_handle = tokio::spawn(start_signal_expiry(
        service.clone(),
        ExpiryConfig::from(&config),
        expiry_token,
    ));

    // Health server (liveness, readiness, metrics)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listeners BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let api_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;
    let api_listener = tokio::net::TcpListener::bind(api_addr).await.map_err(|e| {
        error!(error = %e, addr = %api_addr, "Failed to bind API server");
        format!("Failed to bind API server to {api_addr}: {e}")
    })?;

    let health_shutdown_token = shutdown_token.child_token();
    let health_handle = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    let api_app = build_routes(Arc::new(AppState { service }));
    let api_shutdown_token = shutdown_token.child_token();
    let api_handle = tokio::spawn(async move {
        info!(addr = %api_addr, "Signal API starting");
        let server = axum::serve(api_listener, api_app).with_graceful_shutdown(async move {
            api_shutdown_token.cancelled().await;
            info!("Signal API shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Signal API failed");
        }
    });

    info!("Signal Service running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so the load balancer stops sending traffic
    health_state.begin_drain();
    shutdown_token.cancel();

    let drain = async {
        let _ = tokio::join!(api_handle, health_handle, expiry_handle);
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        error!("Timed out waiting for servers to drain");
    }

    info!("Signal Service shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "signal_service=debug,tower_http=debug".into());

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. Without them the service
/// cannot shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
