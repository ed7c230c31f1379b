//! Key vending service - Main Application Entry Point
//!
//! Sells access keys for a remote key server through a chat gateway. Owners
//! order keys, the operator approves once paid, keys are provisioned and
//! expire after a TTL unless renewed.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (the chat gateway is the client)
//! - **Database**: PostgreSQL with sqlx
//! - **Key server**: Outline-compatible management API over reqwest
//! - **Notifications**: signed JSON webhooks back to the gateway
//! - **Background jobs**: renewal reminders and expiry deactivation on tokio intervals
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Create database connection pool and run migrations
//! 3. Build the lifecycle engine
//! 4. Spawn background jobs
//! 5. Serve HTTP until SIGINT/SIGTERM, then stop the jobs

mod clock;
mod config;
mod conversation;
mod db;
mod error;
mod handlers;
mod middleware;
mod models;
mod naming;
mod scheduler;
mod services;
mod state;
mod store;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::clock::SystemClock;
use crate::conversation::ConversationStore;
use crate::scheduler::ExpirationScheduler;
use crate::services::lifecycle::LifecycleEngine;
use crate::services::notification_service::WebhookNotifier;
use crate::services::provisioning::{ProvisionerHandle, outline_connector};
use crate::state::AppState;
use crate::store::postgres::PgOrderStore;

const CONVERSATION_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads RUST_LOG (defaults to "info")
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = config::Config::from_env()?;
    tracing::info!("Configuration loaded");

    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Database pool created");

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let connector = outline_connector(config.provisioning_settings());
    let provisioner = ProvisionerHandle::new(connector(&config.provisioning_url)?);
    let notifier = WebhookNotifier::new(
        config.notify_url.clone(),
        config.notify_secret.clone(),
        config.notify_timeout(),
    )?;

    let engine = LifecycleEngine::new(
        Arc::new(PgOrderStore::new(pool)),
        Arc::new(provisioner),
        connector,
        Arc::new(notifier),
        Arc::new(SystemClock),
        config.policy(),
    );
    tracing::info!(
        provisioning = %engine.provisioning_endpoint(),
        operator_id = config.operator_id,
        "Lifecycle engine ready"
    );

    let conversations = Arc::new(ConversationStore::new(config.conversation_ttl()));

    let shutdown = CancellationToken::new();
    let mut jobs = ExpirationScheduler::new(
        engine.clone(),
        config.scheduler_intervals(),
        shutdown.clone(),
    )
    .spawn();

    let cleanup_store = conversations.clone();
    jobs.push(tokio::spawn(scheduler::run_periodic(
        "conversation_cleanup",
        CONVERSATION_CLEANUP_INTERVAL,
        shutdown.clone(),
        move || {
            let store = cleanup_store.clone();
            async move {
                let evicted = store.cleanup();
                if evicted > 0 {
                    tracing::debug!(evicted, "Expired conversations evicted");
                }
            }
        },
    )));

    let state = AppState::new(engine, conversations, &config.gateway_token_sha256);
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Running ticks finish; no new tick starts
    shutdown.cancel();
    for job in jobs {
        if let Err(e) = job.await {
            tracing::error!(error = %e, "Background job panicked");
        }
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

fn router(state: AppState) -> Router {
    let operator_routes = Router::new()
        .route(
            "/api/v1/orders/{id}/approve",
            post(handlers::operator::approve_order),
        )
        .route(
            "/api/v1/orders/{id}/reject",
            post(handlers::operator::reject_order),
        )
        .route(
            "/api/v1/orders/{id}/renew",
            post(handlers::operator::renew_order),
        )
        .route(
            "/api/v1/orders/{id}/decline-renewal",
            post(handlers::operator::decline_renewal),
        )
        .route(
            "/api/v1/migrations",
            post(handlers::operator::migrate_backend),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_operator,
        ));

    let gateway_routes = Router::new()
        .route("/api/v1/orders/begin", post(handlers::orders::begin_order))
        .route("/api/v1/orders", post(handlers::orders::place_order))
        .route("/api/v1/orders/cancel", post(handlers::orders::cancel_order))
        .route(
            "/api/v1/owners/{owner_id}/keys",
            get(handlers::owners::list_owner_keys),
        )
        .merge(operator_routes)
        // Outermost, so it runs before the operator check
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::gateway_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .merge(gateway_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = shutdown.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
