use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use super::actions::Crm;
use super::api::{self, AppState, SharedState};
use super::incidents::IncidentLog;
use super::store::{ChangeFeed, open_store};
use super::sync::CrmSync;
use crate::auth;
use crate::config::CrmToml;

const WS_CHANNEL_CAPACITY: usize = 256;

async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = std::time::Instant::now();
    let response = next.run(req).await;
    tracing::debug!(
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

/// Build the full application router: API, WebSocket and request tracing.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let mut app = api::api_router(&state)
        .with_state(state)
        .layer(middleware::from_fn(log_request));

    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Open the store and wire the sync layer, incident log and auth gate around
/// it. The initial load is attempted but a failure does not abort startup:
/// the error stays on the sync state so clients can show the remediation.
pub async fn bootstrap(config: &CrmToml) -> Result<SharedState> {
    let feed = ChangeFeed::default();
    let store = open_store(&config.store, feed.clone()).context("Failed to open CRM store")?;
    let (ws_tx, _rx) = broadcast::channel::<String>(WS_CHANNEL_CAPACITY);

    let sync = Arc::new(CrmSync::new(Arc::clone(&store)).with_events(ws_tx.clone()));
    let incidents = Arc::new(IncidentLog::new(store).with_events(ws_tx.clone()));

    if let Err(e) = sync.refresh_data().await {
        tracing::warn!(error = %e, "initial CRM load failed");
    }
    if let Err(e) = incidents.refresh().await {
        tracing::warn!(error = %e, "initial incident load failed");
    }

    let gate = auth::gate_for(config)?;
    let state = AppState::new(Crm::new(sync), incidents, ws_tx, gate, feed)
        .with_webhook_secret(config.server.webhook_secret.clone())
        .with_dev_mode(config.server.dev_mode);
    Ok(Arc::new(state))
}

/// Start the admin server and block until Ctrl+C.
pub async fn start_server(config: &CrmToml) -> Result<()> {
    config.require_admin_password()?;
    let state = bootstrap(config).await?;
    let watcher = state.crm.sync().spawn_change_watcher(&state.feed);
    let app = build_router(Arc::clone(&state), config.server.dev_mode);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        backend = state.crm.store().backend(),
        auth = state.gate.describe(),
        "WeXlot CRM listening"
    );
    println!("WeXlot CRM running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    watcher.abort();
    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
