//! Dual-write chat relay server
//!
//! Clients publish over a WebSocket; each message is committed to two SQL
//! stores before being broadcast to every connected client.

pub mod config;
pub mod error;
pub mod handlers;
pub mod store;

use axum::{
    routing::{get, post},
    Router,
};
use relay_core::{
    BroadcastHub, Drain, DualWriteCoordinator, MessageIngress, ReconciliationLedger,
    TransactionalStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{AppState, RelayConfig};
use handlers::{list_incidents, replay_incident, ws_handler};
use store::Backend;

/// Wire coordinator, hub, ledger and drain over two stores.
pub fn build_ingress(
    a: Arc<dyn TransactionalStore>,
    b: Arc<dyn TransactionalStore>,
) -> Arc<MessageIngress> {
    let drain = Drain::new();
    let coordinator = DualWriteCoordinator::new(a, b).with_abort(drain.abort_signal());
    Arc::new(MessageIngress::new(
        Arc::new(coordinator),
        Arc::new(BroadcastHub::new()),
        Arc::new(ReconciliationLedger::new()),
        drain,
    ))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/reconciliation", get(list_incidents))
        .route("/reconciliation/{message_id}/replay", post(replay_incident))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Stop taking messages and connections, drain in-flight messages, then
/// disconnect everyone.
pub async fn shutdown(ingress: Arc<MessageIngress>, drain_timeout: Duration) {
    let report = ingress.drain().drain(drain_timeout).await;
    if report.drained {
        info!("all in-flight messages finished");
    } else {
        warn!(
            aborted = report.aborted,
            abandoned = report.abandoned,
            "in-flight messages aborted at shutdown"
        );
    }
    let closed = ingress.hub().close_all();
    info!(closed, "subscribers disconnected");
}

async fn shutdown_signal(ingress: Arc<MessageIngress>, drain_timeout: Duration) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
    shutdown(ingress, drain_timeout).await;
}

pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        // Already set, ignore
    }

    info!("=== Relay Server ===");

    let config = RelayConfig::from_env()?;

    let store_a = Backend::open(&config.store_a)?;
    let store_b = Backend::open(&config.store_b)?;
    info!(
        "Stores: A = {} ({}), B = {} ({})",
        config.store_a.name,
        config.store_a.kind.scheme(),
        config.store_b.name,
        config.store_b.kind.scheme()
    );

    let ingress = build_ingress(store_a.store(), store_b.store());
    let app = router(AppState {
        ingress: ingress.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!("Listening on {} (WebSocket at /ws)", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(ingress, config.drain_timeout))
        .await?;

    store_a.close().await;
    store_b.close().await;
    info!("Relay server stopped");

    Ok(())
}

async fn health_check() -> &'static str {
    "OK - Relay Server"
}
