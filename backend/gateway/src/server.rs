//! HTTP entrypoint for the fleet gateway.
//!
//! One route matters: `/api/notify`, the WebSocket every agent and browser
//! session attaches to. The rest is wiring.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tracing::info;

use armada_bus::EventBus;
use armada_core::FleetStore;

use crate::session::ws_handler;

/// Application state shared across connections.
#[derive(Clone)]
pub struct GatewayState {
    pub bus: Arc<EventBus>,
    pub store: Arc<dyn FleetStore>,
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/health", get(|| async { "OK" }))
        .route("/api/notify", get(ws_handler))
        .with_state(state)
}

/// Bind and serve. Connection info is preserved so sessions can record the
/// transport peer address when no proxy header is present.
pub async fn start_server(addr: SocketAddr, state: GatewayState) -> Result<()> {
    reset_connection_flags(state.store.as_ref()).await?;
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    info!("Gateway listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Clear `connected` flags left behind by a previous process. A stale flag
/// would reject the agent's next login as "already connected".
pub async fn reset_connection_flags(store: &dyn FleetStore) -> Result<()> {
    let agents = store.connected_agents().await?;
    if agents.is_empty() {
        return Ok(());
    }
    info!(count = agents.len(), "resetting stale agent connection flags");
    for mut agent in agents {
        agent.connected = false;
        store.persist_agent(&agent).await?;
    }
    Ok(())
}
