use axum::{routing::get, routing::post, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::auth::handshake;
use crate::hub::Hub;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// How often stale rate limiter entries are dropped.
const LIMITER_CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// GET /health
async fn health() -> &'static str {
    "ok"
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/register", post(handshake::register))
        .route("/login", post(handshake::login));
    let auth_routes = with_auth_rate_limit(auth_routes, &state.hub);

    Router::new()
        .merge(auth_routes)
        .route("/upgrade", get(ws_handler::ws_upgrade))
        .route("/health", get(health))
        .with_state(state)
}

/// Per-IP rate limiting on the handshake endpoints.
/// Uses PeerIpKeyExtractor which reads from ConnectInfo<SocketAddr>.
fn with_auth_rate_limit(routes: Router<AppState>, hub: &Hub) -> Router<AppState> {
    let settings = hub.settings();
    if settings.auth_rate_burst == 0 {
        tracing::info!("Rate limiting on /register and /login disabled");
        return routes;
    }

    let Some(config) = GovernorConfigBuilder::default()
        .key_extractor(PeerIpKeyExtractor)
        .per_second(settings.auth_rate_period.as_secs()) // one token every N seconds
        .burst_size(settings.auth_rate_burst)
        .finish()
    else {
        tracing::warn!("Invalid rate limit settings, limiter disabled");
        return routes;
    };
    let config = Arc::new(config);

    // Background task to clean up rate limiter state
    let limiter = config.limiter().clone();
    match hub.tracker().track("rate_limiter_cleanup") {
        Ok(guard) => {
            let hub = hub.clone();
            tokio::spawn(async move {
                let _guard = guard;
                let mut ticker = tokio::time::interval(LIMITER_CLEANUP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = hub.wait_for_shutdown() => break,
                        _ = ticker.tick() => limiter.retain_recent(),
                    }
                }
            });
        }
        Err(e) => tracing::warn!(error = %e, "Rate limiter cleanup not started"),
    }

    routes.layer(GovernorLayer { config })
}

/// Serve until the hub shuts down. Tracked as `http_server`.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let guard = state
        .hub
        .tracker()
        .track("http_server")
        .map_err(std::io::Error::other)?;
    let hub = state.hub.clone();
    let app = build_router(state);

    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Listening on {}", addr);
    }

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { hub.wait_for_shutdown().await })
    .await;

    drop(guard);
    result
}
