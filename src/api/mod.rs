//! REST read API for engine state.
//!
//! Provides two GET endpoints:
//! - `/state` — the full published engine state
//! - `/devices` — per-device session summaries

mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tokio::sync::watch;

use crate::engine::EngineState;

/// Shared handle on the engine's published state.
///
/// The control loop owns the `watch` sender and publishes a fresh
/// [`EngineState`] every tick; handlers only ever borrow the latest value,
/// so no locks are held across awaits.
pub struct AppState {
    /// Receiving side of the engine's state channel.
    pub state_rx: watch::Receiver<EngineState>,
}

/// Builds the axum router with all API routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/state", get(handlers::get_state))
        .route("/devices", get(handlers::get_devices))
        .with_state(state)
}

/// Binds to the given address and serves the API.
///
/// # Panics
///
/// Panics if the TCP listener cannot bind to `addr`.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind to {addr}: {e}"));
    eprintln!("API server listening on http://{addr}");
    axum::serve(listener, app)
        .await
        .unwrap_or_else(|e| panic!("server error: {e}"));
}
